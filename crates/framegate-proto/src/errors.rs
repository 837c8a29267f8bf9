//! Wire and codec error types.

use bytes::Bytes;
use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the binary record layer.
///
/// These cover the Avro binary primitives (varints, length-prefixed
/// bytes/strings, maps, unions). Truncation carries how many more bytes
/// the reader needed, which the framed decoder uses to distinguish "wait
/// for more input" from "malformed input".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the value did.
    #[error("truncated value: {needed} more byte(s) needed")]
    Truncated {
        /// Additional bytes required to finish the read.
        needed: usize,
    },

    /// A varint ran past the 10-byte limit for a 64-bit value.
    #[error("varint exceeds 10 bytes")]
    VarintOverflow,

    /// A length prefix was negative.
    #[error("negative length prefix: {len}")]
    NegativeLength {
        /// The decoded length.
        len: i64,
    },

    /// A string value was not valid UTF-8.
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,

    /// A union branch or enum symbol index was out of range.
    #[error("branch index {branch} out of range for {kind}")]
    InvalidBranch {
        /// What was being decoded (union or enum name).
        kind: &'static str,
        /// The offending index.
        branch: i64,
    },
}

/// Errors produced by the framed codec and payload layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A record-level decode failed.
    #[error("wire decode failed: {0}")]
    Wire(#[from] WireError),

    /// The input ended with a buffered partial frame group.
    ///
    /// Carries the exact unconsumed bytes for diagnostics.
    #[error("trailing data at end of stream ({} byte(s))", leftover.len())]
    TrailingData {
        /// Bytes left in the buffer when the stream ended.
        leftover: Bytes,
    },

    /// The packet header map could not be decoded.
    #[error("truncated request headers")]
    TruncatedHeaders,

    /// A frame group declared a negative frame count.
    #[error("negative frame count: {count}")]
    NegativeFrameCount {
        /// The declared count.
        count: i32,
    },

    /// A frame group declared more frames than the decoder accepts.
    #[error("frame count {count} exceeds limit {max}")]
    TooManyFrames {
        /// The declared count.
        count: i32,
        /// The configured limit.
        max: u32,
    },

    /// A frame length prefix was negative or above the size limit.
    #[error("frame length {len} outside accepted range (max {max})")]
    InvalidFrameLength {
        /// The declared length.
        len: i64,
        /// The configured limit.
        max: u32,
    },

    /// Underlying stream I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
