//! Packet payload codec.
//!
//! The inner payload of every frame group is a header map (`map<bytes>`)
//! followed by the raw body. The body's interpretation belongs to the
//! business layer; the one exception is the system-error shape this module
//! synthesizes: a body of `0x01 0x00` (error union discriminator, then the
//! system-error variant tag) followed by the encoded [`SystemError`] record.
//! Both tag bytes are mandatory and bit-exact.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result, WireError},
    wire::{self, WireCursor},
};

/// Leading body byte meaning "no error, empty response".
pub const BODY_EMPTY_OK: u8 = 0x00;

/// Body prefix marking a system-error payload.
pub const SYSTEM_ERROR_PREFIX: [u8; 2] = [0x01, 0x00];

/// Decoded request or response payload: a header map plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Transport-visible headers.
    pub headers: HashMap<String, Bytes>,
    /// Business payload, not interpreted by the transport.
    pub body: Bytes,
}

impl Packet {
    /// Build a packet from headers and body.
    pub fn new(headers: HashMap<String, Bytes>, body: impl Into<Bytes>) -> Self {
        Self { headers, body: body.into() }
    }

    /// Build a headerless packet.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self { headers: HashMap::new(), body: body.into() }
    }

    /// The one-byte "no error, empty response" payload.
    pub fn empty_ok() -> Self {
        Self::from_body(Bytes::from_static(&[BODY_EMPTY_OK]))
    }

    /// Synthesize a system-error payload carrying `error`.
    pub fn system_error(error: &SystemError, headers: HashMap<String, Bytes>) -> Self {
        let mut body = BytesMut::new();
        body.put_slice(&SYSTEM_ERROR_PREFIX);
        error.encode(&mut body);
        Self { headers, body: body.freeze() }
    }

    /// Whether the body carries a system error.
    pub fn is_system_error(&self) -> bool {
        self.body.starts_with(&SYSTEM_ERROR_PREFIX)
    }

    /// Decode the system error out of an error-tagged body, if any.
    pub fn decode_system_error(&self) -> Option<SystemError> {
        if !self.is_system_error() {
            return None;
        }
        let mut cur = WireCursor::new(&self.body[SYSTEM_ERROR_PREFIX.len()..]);
        SystemError::decode(&mut cur).ok()
    }

    /// Append the payload's wire encoding to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        wire::write_bytes_map(dst, &self.headers);
        dst.put_slice(&self.body);
    }

    /// Decode a payload from the concatenated frame bytes.
    ///
    /// The body is sliced out of `buf` without copying. Fails with
    /// [`ProtocolError::TruncatedHeaders`] when the header map refuses the
    /// buffer.
    pub fn decode(buf: &Bytes) -> Result<Self> {
        let mut cur = WireCursor::new(buf);
        let headers = cur.read_bytes_map().map_err(|_| ProtocolError::TruncatedHeaders)?;
        let body = buf.slice(cur.position()..);
        Ok(Self { headers, body })
    }
}

/// System-error record: a stable code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemError {
    /// One of the [`codes`] constants.
    pub code: String,
    /// Free-form description.
    pub message: String,
}

impl SystemError {
    /// Build an error with the given code and message.
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self { code: code.to_string(), message: message.into() }
    }

    /// Wrap a foreign error under `code`, passing a [`SystemError`] through
    /// unchanged.
    pub fn or_code(code: &str, error: &(impl std::fmt::Display + ?Sized)) -> Self {
        Self::new(code, error.to_string())
    }

    /// Append the record's wire encoding to `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        wire::write_str(dst, &self.code);
        wire::write_str(dst, &self.message);
    }

    /// Decode a record, advancing the cursor past it.
    pub fn decode(cur: &mut WireCursor<'_>) -> std::result::Result<Self, WireError> {
        let code = cur.read_str()?;
        let message = cur.read_str()?;
        Ok(Self { code, message })
    }
}

impl std::fmt::Display for SystemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SystemError {}

/// Stable system-error codes carried on the wire.
pub mod codes {
    /// The server does not recognize the client's fingerprint; retry with
    /// the protocol text attached.
    pub const UNKNOWN_CLIENT_PROTOCOL: &str = "UNKNOWN_CLIENT_PROTOCOL";
    /// The handler behind the router failed.
    pub const CHANNEL_FAILURE: &str = "CHANNEL_FAILURE";
    /// The call's deadline elapsed before a response arrived.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// The owning bridge was torn down with the call in flight.
    pub const BRIDGE_DESTROYED: &str = "BRIDGE_DESTROYED";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let packet = Packet::new(
            HashMap::from([("avro.protocols".to_string(), Bytes::from_static(b"[]"))]),
            Bytes::from_static(&[1, 2, 3]),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        let decoded = Packet::decode(&buf.freeze()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn empty_buffer_is_truncated_headers() {
        let err = Packet::decode(&Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedHeaders));
    }

    #[test]
    fn body_survives_headerless_encoding() {
        let packet = Packet::from_body(Bytes::from_static(b"opaque"));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);

        // Single 0x00 map terminator, then the body verbatim.
        assert_eq!(&buf[..], b"\x00opaque");
    }

    #[test]
    fn system_error_prefix_is_bit_exact() {
        let error = SystemError::new(codes::CHANNEL_FAILURE, "boom");
        let packet = Packet::system_error(&error, HashMap::new());

        assert_eq!(&packet.body[..2], &[0x01, 0x00]);
        assert!(packet.is_system_error());
        assert_eq!(packet.decode_system_error().unwrap(), error);
    }

    #[test]
    fn empty_ok_is_single_zero_byte() {
        assert_eq!(&Packet::empty_ok().body[..], &[0x00]);
    }

    #[test]
    fn plain_body_is_not_a_system_error() {
        let packet = Packet::from_body(Bytes::from_static(&[0x00, 0x42]));
        assert!(!packet.is_system_error());
        assert!(packet.decode_system_error().is_none());
    }
}
