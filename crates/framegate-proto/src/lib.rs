//! Wire layer of the framegate RPC transport.
//!
//! Implements the Netty-style framed wire protocol historically associated
//! with the Avro RPC framework: frame groups keyed by a 32-bit call id,
//! Avro-binary handshake records for protocol-fingerprint negotiation, and
//! the header-map-plus-body packet payload.
//!
//! The crate is pure stream transformation; it owns no sockets and spawns
//! no tasks. The client bridge and server gateway crates drive these codecs
//! through `tokio_util`'s `FramedRead`/`FramedWrite`.

pub mod codec;
pub mod errors;
pub mod handshake;
pub mod payload;
pub mod wire;

pub use codec::{FrameGroup, GroupDecoder, MAX_FRAME_COUNT, MAX_FRAME_LEN, Message, MessageDecoder, MessageEncoder};
pub use errors::{ProtocolError, WireError};
pub use handshake::{
    Fingerprint, HandshakeMatch, HandshakeRecord, HandshakeRequest, HandshakeResponse,
    META_TRACE_DEADLINE, META_TRACE_LABELS,
};
pub use payload::{BODY_EMPTY_OK, Packet, SYSTEM_ERROR_PREFIX, SystemError, codes};

/// Header key under which a gateway lists its services' protocols.
pub const HEADER_PROTOCOLS: &str = "avro.protocols";

/// Decoder for server-bound traffic (requests).
pub type RequestDecoder = MessageDecoder<HandshakeRequest>;
/// Decoder for client-bound traffic (responses).
pub type ResponseDecoder = MessageDecoder<HandshakeResponse>;
/// Encoder for server-bound traffic (requests).
pub type RequestEncoder = MessageEncoder<HandshakeRequest>;
/// Encoder for client-bound traffic (responses).
pub type ResponseEncoder = MessageEncoder<HandshakeResponse>;
