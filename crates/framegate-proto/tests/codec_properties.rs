//! Property-based tests for the framed codec.
//!
//! Verifies the wire-level identities for all valid inputs, not just
//! specific examples: encode-then-decode is the identity on
//! (id, handshake, packet), and decoding is invariant under arbitrary
//! re-chunking of the byte stream.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use framegate_proto::{
    HandshakeMatch, HandshakeRequest, HandshakeResponse, Message, MessageDecoder, MessageEncoder,
    Packet, ProtocolError,
};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn arbitrary_fingerprint() -> impl Strategy<Value = [u8; 16]> {
    any::<[u8; 16]>()
}

fn arbitrary_meta() -> impl Strategy<Value = HashMap<String, Bytes>> {
    prop::collection::hash_map("[a-z.]{1,16}", prop::collection::vec(any::<u8>(), 0..24), 0..4)
        .prop_map(|map| map.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect())
}

fn arbitrary_packet() -> impl Strategy<Value = Packet> {
    (arbitrary_meta(), prop::collection::vec(any::<u8>(), 0..256))
        .prop_map(|(headers, body)| Packet::new(headers, body))
}

fn arbitrary_request() -> impl Strategy<Value = HandshakeRequest> {
    (
        arbitrary_fingerprint(),
        prop::option::of("\\{.{0,32}\\}"),
        arbitrary_fingerprint(),
        arbitrary_meta(),
    )
        .prop_map(|(client_hash, client_protocol, server_hash, meta)| HandshakeRequest {
            client_hash,
            client_protocol,
            server_hash,
            meta,
        })
}

fn arbitrary_outcome() -> impl Strategy<Value = HandshakeMatch> {
    prop_oneof![
        Just(HandshakeMatch::Both),
        Just(HandshakeMatch::Client),
        Just(HandshakeMatch::None),
    ]
}

fn arbitrary_response() -> impl Strategy<Value = HandshakeResponse> {
    (
        arbitrary_outcome(),
        prop::option::of("\\{.{0,32}\\}"),
        prop::option::of(arbitrary_fingerprint()),
        arbitrary_meta(),
    )
        .prop_map(|(outcome, server_protocol, server_hash, meta)| HandshakeResponse {
            outcome,
            server_protocol,
            server_hash,
            meta,
        })
}

fn arbitrary_request_message() -> impl Strategy<Value = Message<HandshakeRequest>> {
    (any::<i32>(), arbitrary_request(), arbitrary_packet()).prop_map(|(id, handshake, packet)| {
        Message::with_handshake(id, handshake, packet)
    })
}

fn arbitrary_response_message() -> impl Strategy<Value = Message<HandshakeResponse>> {
    (any::<i32>(), arbitrary_response(), arbitrary_packet()).prop_map(|(id, handshake, packet)| {
        Message::with_handshake(id, handshake, packet)
    })
}

#[test]
fn prop_request_encode_decode_roundtrip() {
    proptest!(|(message in arbitrary_request_message())| {
        let mut encoder = MessageEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(message.clone(), &mut wire).expect("encode should succeed");

        let mut decoder = MessageDecoder::<HandshakeRequest>::new();
        let decoded = decoder.decode(&mut wire).expect("decode should succeed").expect("one message");

        prop_assert_eq!(decoded, message);
        prop_assert!(wire.is_empty(), "decoder must consume the whole group");
    });
}

#[test]
fn prop_response_encode_decode_roundtrip() {
    proptest!(|(message in arbitrary_response_message())| {
        let mut encoder = MessageEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(message.clone(), &mut wire).expect("encode should succeed");

        let mut decoder = MessageDecoder::<HandshakeResponse>::new();
        let decoded = decoder.decode(&mut wire).expect("decode should succeed").expect("one message");

        prop_assert_eq!(decoded, message);
    });
}

#[test]
fn prop_chunking_invariance() {
    proptest!(|(
        messages in prop::collection::vec(arbitrary_request_message(), 1..6),
        splits in prop::collection::vec(1usize..64, 0..32),
    )| {
        let mut encoder = MessageEncoder::new();
        let mut wire = BytesMut::new();
        for message in &messages {
            encoder.encode(message.clone(), &mut wire).expect("encode should succeed");
        }
        let wire = wire.freeze();

        // Feed the same bytes in arbitrary sub-chunks.
        let mut decoder = MessageDecoder::<HandshakeRequest>::new();
        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut split_iter = splits.into_iter();
        while offset < wire.len() {
            let step = split_iter.next().unwrap_or(wire.len()).min(wire.len() - offset);
            src.extend_from_slice(&wire[offset..offset + step]);
            offset += step;
            while let Some(message) = decoder.decode(&mut src).expect("decode should succeed") {
                decoded.push(message);
            }
        }
        if let Some(message) = decoder.decode_eof(&mut src).expect("eof should be clean") {
            decoded.push(message);
        }

        prop_assert_eq!(decoded, messages);
    });
}

#[test]
fn prop_trailing_bytes_preserved_in_error() {
    proptest!(|(
        message in arbitrary_request_message(),
        stray in prop::collection::vec(any::<u8>(), 1..8),
    )| {
        let mut encoder = MessageEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(message, &mut wire).expect("encode should succeed");
        wire.extend_from_slice(&stray);

        let mut decoder = MessageDecoder::<HandshakeRequest>::new();
        prop_assert!(decoder.decode(&mut wire).expect("decode should succeed").is_some());

        // Whatever remains buffered at end-of-input comes back verbatim.
        match decoder.decode_eof(&mut wire) {
            Err(ProtocolError::TrailingData { leftover }) => {
                prop_assert_eq!(&leftover[..], &stray[..]);
            }
            other => prop_assert!(false, "expected trailing data error, got {:?}", other.is_ok()),
        }
    });
}
