//! Fuzz target for full message decoding (handshake + payload)
//!
//! # Strategy
//!
//! - Raw bytes through the request decoder, including its optimistic
//!   handshake fallback and sticky downgrade
//! - Every successfully decoded message is re-encoded and re-decoded
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - decode(encode(m)) == m for every message the decoder accepts

#![no_main]

use bytes::BytesMut;
use framegate_proto::{HandshakeRequest, MessageDecoder, MessageEncoder};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::{Decoder, Encoder};

fuzz_target!(|data: &[u8]| {
    let mut decoder = MessageDecoder::<HandshakeRequest>::new();
    let mut src = BytesMut::from(data);

    loop {
        match decoder.decode(&mut src) {
            Ok(Some(message)) => {
                // Anything we accept must round-trip through our encoder.
                let mut wire = BytesMut::new();
                let mut encoder = MessageEncoder::new();
                if encoder.encode(message.clone(), &mut wire).is_err() {
                    continue;
                }
                let mut fresh = MessageDecoder::<HandshakeRequest>::new();
                if message.handshake.is_some() {
                    let again = fresh
                        .decode(&mut wire)
                        .expect("re-decode of encoded message failed")
                        .expect("encoded message produced no output");
                    assert_eq!(again, message);
                }
            },
            Ok(None) => break,
            Err(_) => return,
        }
    }
    let _ = decoder.decode_eof(&mut src);
});
