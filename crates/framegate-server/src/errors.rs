//! Gateway error types.

use thiserror::Error;

use framegate_core::TraceError;
use framegate_proto::ProtocolError;

/// Connection-scoped failures that terminate one gateway connection.
///
/// None of these affect other connections; they are logged and surfaced on
/// the router's event channel.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A request arrived with no handshake and no prior state on a fresh
    /// connection.
    #[error("expected handshake")]
    ExpectedHandshake,

    /// The handshake meta carried an undecodable trace context.
    #[error("invalid trace meta: {0}")]
    InvalidTraceMeta(#[from] TraceError),

    /// The framed decoder rejected the stream.
    #[error("request stream failed: {0}")]
    Decode(#[from] ProtocolError),
}
