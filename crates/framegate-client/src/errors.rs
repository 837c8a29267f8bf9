//! Client bridge error types.

use thiserror::Error;

use framegate_core::TraceError;
use framegate_proto::SystemError;

/// Errors a call through the bridge can complete with.
///
/// Only [`BridgeError::Trace`] is call-local; the other variants describe
/// the call's fate relative to the bridge lifecycle. A wire or I/O failure
/// never surfaces here directly: it destroys the bridge and every pending
/// call completes with [`BridgeError::Destroyed`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bridge no longer accepts new calls.
    #[error("bridge is closed")]
    Closed,

    /// The bridge was torn down with this call in flight.
    #[error("bridge destroyed: {0}")]
    Destroyed(String),

    /// The call completed with a transport-level system error, e.g. its
    /// trace went inactive before a response arrived.
    #[error(transparent)]
    System(#[from] SystemError),

    /// The call's trace context could not be serialized. Fails only the
    /// originating call; the bridge continues.
    #[error("trace context serialization failed: {0}")]
    Trace(#[from] TraceError),

    /// A discovery response could not be interpreted.
    #[error("discovery failed: {0}")]
    Discovery(String),
}
