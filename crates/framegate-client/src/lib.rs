//! Client side of the framegate transport.
//!
//! A [`ClientBridge`] multiplexes many in-flight calls over one duplex
//! stream, negotiates protocol fingerprints via the handshake records, and
//! retries once on a reported mismatch. [`netty_router`] layers service
//! discovery on top, yielding a [`BridgeRouter`] for a remote gateway's
//! whole service list.

pub mod bridge;
pub mod discovery;
pub mod errors;

pub use bridge::{BridgeEvent, CallReply, ClientBridge};
pub use discovery::{BridgeRouter, RouterOptions, netty_router};
pub use errors::BridgeError;
