//! Fuzz target for frame-group boundary resumption
//!
//! # Strategy
//!
//! - Arbitrary bytes: malformed headers, lengths, and counts
//! - Arbitrary chunk splits: the same bytes fed byte-ranges at a time
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - Chunking invariance: the emitted groups and the error/no-error outcome
//!   match a single whole-buffer feed exactly
//! - Claimed frame lengths above the limit are rejected, not allocated

#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use framegate_proto::{FrameGroup, GroupDecoder};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    splits: Vec<u8>,
}

/// Feed `data` in chunks of the given sizes (0 = rest), collecting emitted
/// groups until the first error.
fn run(data: &[u8], splits: &[u8]) -> (Vec<FrameGroup>, bool) {
    let mut decoder = GroupDecoder::new();
    let mut src = BytesMut::new();
    let mut groups = Vec::new();
    let mut offset = 0usize;
    let mut split_iter = splits.iter().copied();

    while offset < data.len() {
        let step = match split_iter.next() {
            Some(0) | None => data.len() - offset,
            Some(n) => (n as usize).min(data.len() - offset),
        };
        src.extend_from_slice(&data[offset..offset + step]);
        offset += step;
        loop {
            match decoder.decode(&mut src) {
                Ok(Some(group)) => groups.push(group),
                Ok(None) => break,
                Err(_) => return (groups, true),
            }
        }
    }
    loop {
        match decoder.decode_eof(&mut src) {
            Ok(Some(group)) => groups.push(group),
            Ok(None) => return (groups, false),
            Err(_) => return (groups, true),
        }
    }
}

fuzz_target!(|input: Input| {
    let whole = run(&input.data, &[]);
    let chunked = run(&input.data, &input.splits);
    assert_eq!(whole, chunked);
});
