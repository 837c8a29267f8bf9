//! Handshake negotiation records.
//!
//! Every request may carry a [`HandshakeRequest`] announcing which protocol
//! the client speaks (by 16-byte fingerprint) and which protocol it believes
//! the server speaks. The response carries a [`HandshakeResponse`] whose
//! [`HandshakeMatch`] tells the client whether either guess was right and,
//! when needed, the server's own protocol text so the client can finish
//! negotiation in one retry.
//!
//! Field order and branch indexes are pinned by the wire protocol; the
//! records round-trip bit-exactly.

use std::collections::HashMap;

use bytes::{BufMut, Bytes};

use crate::{
    errors::WireError,
    wire::{self, FINGERPRINT_LEN, WireCursor},
};

/// Meta key carrying the call's absolute deadline (long, Unix millis).
pub const META_TRACE_DEADLINE: &str = "avro.trace.deadline";

/// Meta key carrying the call's trace labels (`map<string>` of JSON values).
pub const META_TRACE_LABELS: &str = "avro.trace.labels";

/// A 16-byte protocol fingerprint, treated as opaque.
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Handshake outcome reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Both fingerprints were recognized; the call went through.
    Both,
    /// The client was recognized but guessed the server's protocol wrong;
    /// the response carries the server's protocol and fingerprint.
    Client,
    /// The client's fingerprint is unknown; it must retry with its
    /// protocol text attached.
    None,
}

impl HandshakeMatch {
    fn from_index(index: i64) -> Result<Self, WireError> {
        match index {
            0 => Ok(Self::Both),
            1 => Ok(Self::Client),
            2 => Ok(Self::None),
            branch => Err(WireError::InvalidBranch { kind: "HandshakeMatch", branch }),
        }
    }

    fn index(self) -> i32 {
        match self {
            Self::Both => 0,
            Self::Client => 1,
            Self::None => 2,
        }
    }
}

/// Handshake record attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Fingerprint of the client's protocol.
    pub client_hash: Fingerprint,
    /// Protocol text, attached only when a previous response reported
    /// [`HandshakeMatch::None`].
    pub client_protocol: Option<String>,
    /// Fingerprint the client believes the server has. Falls back to the
    /// client's own fingerprint when the server is still unknown.
    pub server_hash: Fingerprint,
    /// Out-of-band metadata, notably trace context.
    pub meta: HashMap<String, Bytes>,
}

/// Handshake record attached to responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Negotiation outcome.
    pub outcome: HandshakeMatch,
    /// Server protocol text, present when the client needs it.
    pub server_protocol: Option<String>,
    /// Server protocol fingerprint, present alongside `server_protocol`.
    pub server_hash: Option<Fingerprint>,
    /// Out-of-band metadata.
    pub meta: HashMap<String, Bytes>,
}

/// A record that can appear in the handshake slot of a frame group.
///
/// Implemented by [`HandshakeRequest`] (server-bound traffic) and
/// [`HandshakeResponse`] (client-bound traffic); the framed codec is
/// generic over the direction.
pub trait HandshakeRecord: Sized + Send + std::fmt::Debug {
    /// Append the record's wire encoding to `dst`.
    fn encode(&self, dst: &mut impl BufMut);

    /// Decode a record, advancing the cursor past it.
    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, WireError>;
}

impl HandshakeRecord for HandshakeRequest {
    fn encode(&self, dst: &mut impl BufMut) {
        wire::write_fixed16(dst, &self.client_hash);
        write_optional_str(dst, self.client_protocol.as_deref());
        wire::write_fixed16(dst, &self.server_hash);
        write_meta(dst, &self.meta);
    }

    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, WireError> {
        let client_hash = cur.read_fixed16()?;
        let client_protocol = read_optional(cur, "clientProtocol", WireCursor::read_str)?;
        let server_hash = cur.read_fixed16()?;
        let meta = read_meta(cur)?;
        Ok(Self { client_hash, client_protocol, server_hash, meta })
    }
}

impl HandshakeRecord for HandshakeResponse {
    fn encode(&self, dst: &mut impl BufMut) {
        wire::write_int(dst, self.outcome.index());
        write_optional_str(dst, self.server_protocol.as_deref());
        match &self.server_hash {
            None => wire::write_long(dst, 0),
            Some(hash) => {
                wire::write_long(dst, 1);
                wire::write_fixed16(dst, hash);
            },
        }
        write_meta(dst, &self.meta);
    }

    fn decode(cur: &mut WireCursor<'_>) -> Result<Self, WireError> {
        let outcome = HandshakeMatch::from_index(i64::from(cur.read_int()?))?;
        let server_protocol = read_optional(cur, "serverProtocol", WireCursor::read_str)?;
        let server_hash = read_optional(cur, "serverHash", WireCursor::read_fixed16)?;
        let meta = read_meta(cur)?;
        Ok(Self { outcome, server_protocol, server_hash, meta })
    }
}

/// Write a `union {null, string}` value.
fn write_optional_str(dst: &mut impl BufMut, value: Option<&str>) {
    match value {
        None => wire::write_long(dst, 0),
        Some(text) => {
            wire::write_long(dst, 1);
            wire::write_str(dst, text);
        },
    }
}

/// Write a `union {null, map<bytes>}` value; an empty map encodes as null.
fn write_meta(dst: &mut impl BufMut, meta: &HashMap<String, Bytes>) {
    if meta.is_empty() {
        wire::write_long(dst, 0);
    } else {
        wire::write_long(dst, 1);
        wire::write_bytes_map(dst, meta);
    }
}

fn read_optional<'a, T>(
    cur: &mut WireCursor<'a>,
    kind: &'static str,
    read: impl FnOnce(&mut WireCursor<'a>) -> Result<T, WireError>,
) -> Result<Option<T>, WireError> {
    match cur.read_long()? {
        0 => Ok(None),
        1 => read(cur).map(Some),
        branch => Err(WireError::InvalidBranch { kind, branch }),
    }
}

fn read_meta(cur: &mut WireCursor<'_>) -> Result<HashMap<String, Bytes>, WireError> {
    match cur.read_long()? {
        0 => Ok(HashMap::new()),
        1 => cur.read_bytes_map(),
        branch => Err(WireError::InvalidBranch { kind: "meta", branch }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HandshakeRequest {
        HandshakeRequest {
            client_hash: [0xaa; 16],
            client_protocol: Some("{\"protocol\":\"Echo\"}".to_string()),
            server_hash: [0xbb; 16],
            meta: HashMap::from([("k".to_string(), Bytes::from_static(b"v"))]),
        }
    }

    #[test]
    fn request_round_trip() {
        let original = request();
        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cur = WireCursor::new(&buf);
        let decoded = HandshakeRequest::decode(&mut cur).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn response_round_trip() {
        let original = HandshakeResponse {
            outcome: HandshakeMatch::Client,
            server_protocol: Some("{\"protocol\":\"Echo\"}".to_string()),
            server_hash: Some([0x11; 16]),
            meta: HashMap::new(),
        };
        let mut buf = Vec::new();
        original.encode(&mut buf);

        let mut cur = WireCursor::new(&buf);
        let decoded = HandshakeResponse::decode(&mut cur).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn absent_fields_encode_as_null_branch() {
        let request = HandshakeRequest {
            client_hash: [0; 16],
            client_protocol: None,
            server_hash: [0; 16],
            meta: HashMap::new(),
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);

        // fixed16 + null + fixed16 + null = 34 bytes.
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[16], 0x00);
        assert_eq!(buf[33], 0x00);
    }

    #[test]
    fn match_indexes_are_pinned() {
        for (outcome, byte) in [
            (HandshakeMatch::Both, 0x00u8),
            (HandshakeMatch::Client, 0x02),
            (HandshakeMatch::None, 0x04),
        ] {
            let response = HandshakeResponse {
                outcome,
                server_protocol: None,
                server_hash: None,
                meta: HashMap::new(),
            };
            let mut buf = Vec::new();
            response.encode(&mut buf);
            assert_eq!(buf[0], byte);
        }
    }

    #[test]
    fn unknown_match_index_rejected() {
        // Zigzag 3 = 0x06.
        let buf = [0x06u8, 0x00, 0x00, 0x00];
        let mut cur = WireCursor::new(&buf);
        let err = HandshakeResponse::decode(&mut cur).unwrap_err();
        assert_eq!(err, WireError::InvalidBranch { kind: "HandshakeMatch", branch: 3 });
    }

    #[test]
    fn truncated_request_reports_missing_bytes() {
        let mut buf = Vec::new();
        request().encode(&mut buf);
        let mut cur = WireCursor::new(&buf[..10]);
        assert!(matches!(
            HandshakeRequest::decode(&mut cur),
            Err(WireError::Truncated { needed: 6 })
        ));
    }
}
