//! Collaborator surfaces of the framegate transport.
//!
//! The wire layer (`framegate-proto`) moves bytes; this crate defines what
//! the transport moves them *for*: services identified by protocol
//! fingerprint, traces carrying deadlines and labels end-to-end, and the
//! router/channel seam business handlers plug into.

pub mod router;
pub mod service;
pub mod trace;

pub use router::{BoxError, Channel, Router, RouterEvent};
pub use service::{DISCOVERY_PROTOCOL, Service, ServiceError};
pub use trace::{Finalizer, Trace, TraceError};
