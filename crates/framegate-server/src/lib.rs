//! Server side of the framegate transport.
//!
//! A [`Gateway`] accepts duplex streams, demultiplexes framed requests,
//! negotiates handshakes per call, and forwards decoded packets into a
//! `framegate_core::Router`. Each connection runs on its own task pair;
//! connection-scoped failures surface on the router's event channel.

pub mod errors;
pub mod gateway;

pub use errors::ConnectionError;
pub use gateway::Gateway;
