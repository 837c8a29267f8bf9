//! Avro binary primitives.
//!
//! The handshake records, header maps, and trace metadata all use the Avro
//! binary encoding: zigzag varints for integers, length-prefixed bytes and
//! strings, raw bytes for fixed-size fields, and block-structured maps. The
//! byte layout here is pinned by the wire protocol; every helper round-trips
//! bit-exactly.
//!
//! Reads go through [`WireCursor`], which tracks an offset into a borrowed
//! buffer and reports truncation as [`WireError::Truncated`] with the number
//! of missing bytes. Writes append to any [`BufMut`].

use std::collections::HashMap;

use bytes::{BufMut, Bytes};

use crate::errors::WireError;

/// Longest legal varint for a 64-bit value.
const MAX_VARINT_LEN: usize = 10;

/// Width of a protocol fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Incremental reader over a borrowed buffer.
///
/// Reads advance an internal offset; nothing is consumed from the
/// underlying buffer, so a failed read leaves the cursor usable for
/// diagnostics via [`WireCursor::position`].
#[derive(Debug)]
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset into the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let available = self.remaining();
        if available < len {
            return Err(WireError::Truncated { needed: len - available });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a zigzag varint long.
    pub fn read_long(&mut self) -> Result<i64, WireError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        for i in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.buf.get(self.pos + i) else {
                return Err(WireError::Truncated { needed: 1 });
            };
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                self.pos += i + 1;
                // Undo zigzag: LSB is the sign.
                return Ok(((value >> 1) as i64) ^ -((value & 1) as i64));
            }
            shift += 7;
        }
        Err(WireError::VarintOverflow)
    }

    /// Read a zigzag varint int, rejecting values outside `i32`.
    pub fn read_int(&mut self) -> Result<i32, WireError> {
        let value = self.read_long()?;
        i32::try_from(value).map_err(|_| WireError::VarintOverflow)
    }

    fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_long()?;
        if len < 0 {
            return Err(WireError::NegativeLength { len });
        }
        usize::try_from(len).map_err(|_| WireError::NegativeLength { len })
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_len()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, WireError> {
        let len = self.read_len()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read a 16-byte fixed value (protocol fingerprint).
    pub fn read_fixed16(&mut self) -> Result<[u8; FINGERPRINT_LEN], WireError> {
        let raw = self.take(FINGERPRINT_LEN)?;
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Read a `map<bytes>` value.
    ///
    /// Maps are a sequence of blocks, each a signed count followed by that
    /// many key/value pairs, terminated by a count of zero. A negative
    /// count means the block's byte size follows (emitted by some writers
    /// to allow skipping); the size is read and discarded.
    pub fn read_bytes_map(&mut self) -> Result<HashMap<String, Bytes>, WireError> {
        let mut map = HashMap::new();
        self.read_map_blocks(|cur| {
            let key = cur.read_str()?;
            let value = cur.read_bytes()?;
            map.insert(key, value);
            Ok(())
        })?;
        Ok(map)
    }

    /// Read a `map<string>` value.
    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>, WireError> {
        let mut map = HashMap::new();
        self.read_map_blocks(|cur| {
            let key = cur.read_str()?;
            let value = cur.read_str()?;
            map.insert(key, value);
            Ok(())
        })?;
        Ok(map)
    }

    fn read_map_blocks(
        &mut self,
        mut entry: impl FnMut(&mut Self) -> Result<(), WireError>,
    ) -> Result<(), WireError> {
        loop {
            let mut count = self.read_long()?;
            if count == 0 {
                return Ok(());
            }
            if count < 0 {
                count = count.checked_neg().ok_or(WireError::NegativeLength { len: count })?;
                let _block_size = self.read_long()?;
            }
            for _ in 0..count {
                entry(self)?;
            }
        }
    }
}

/// Write a zigzag varint long.
pub fn write_long(dst: &mut impl BufMut, value: i64) {
    let mut encoded = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (encoded & 0x7f) as u8;
        encoded >>= 7;
        if encoded == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Write a zigzag varint int.
pub fn write_int(dst: &mut impl BufMut, value: i32) {
    write_long(dst, i64::from(value));
}

/// Write a length-prefixed byte string.
pub fn write_bytes(dst: &mut impl BufMut, value: &[u8]) {
    write_long(dst, value.len() as i64);
    dst.put_slice(value);
}

/// Write a length-prefixed UTF-8 string.
pub fn write_str(dst: &mut impl BufMut, value: &str) {
    write_bytes(dst, value.as_bytes());
}

/// Write a 16-byte fixed value.
pub fn write_fixed16(dst: &mut impl BufMut, value: &[u8; FINGERPRINT_LEN]) {
    dst.put_slice(value);
}

/// Write a `map<bytes>` value as a single block plus terminator.
pub fn write_bytes_map(dst: &mut impl BufMut, map: &HashMap<String, Bytes>) {
    if !map.is_empty() {
        write_long(dst, map.len() as i64);
        for (key, value) in map {
            write_str(dst, key);
            write_bytes(dst, value);
        }
    }
    write_long(dst, 0);
}

/// Write a `map<string>` value as a single block plus terminator.
pub fn write_string_map(dst: &mut impl BufMut, map: &HashMap<String, String>) {
    if !map.is_empty() {
        write_long(dst, map.len() as i64);
        for (key, value) in map {
            write_str(dst, key);
            write_str(dst, value);
        }
    }
    write_long(dst, 0);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn long_zigzag_layout() {
        // Reference values from the Avro binary encoding.
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-2, &[0x03]),
            (2, &[0x04]),
            (-64, &[0x7f]),
            (64, &[0x80, 0x01]),
        ];
        for &(value, expected) in cases {
            let mut buf = Vec::new();
            write_long(&mut buf, value);
            assert_eq!(buf, expected, "encoding {value}");

            let mut cur = WireCursor::new(&buf);
            assert_eq!(cur.read_long().unwrap(), value);
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn truncated_long_reports_needed() {
        let mut cur = WireCursor::new(&[0x80]);
        assert_eq!(cur.read_long(), Err(WireError::Truncated { needed: 1 }));
        // A failed read must not advance the cursor.
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn truncated_bytes_reports_needed() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello");
        let mut cur = WireCursor::new(&buf[..3]);
        assert_eq!(cur.read_bytes(), Err(WireError::Truncated { needed: 3 }));
    }

    #[test]
    fn varint_overflow_rejected() {
        let mut cur = WireCursor::new(&[0xff; 11]);
        assert_eq!(cur.read_long(), Err(WireError::VarintOverflow));
    }

    #[test]
    fn negative_length_rejected() {
        let mut buf = Vec::new();
        write_long(&mut buf, -5);
        let mut cur = WireCursor::new(&buf);
        assert_eq!(cur.read_bytes(), Err(WireError::NegativeLength { len: -5 }));
    }

    #[test]
    fn empty_map_is_single_zero() {
        let mut buf = Vec::new();
        write_bytes_map(&mut buf, &HashMap::new());
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn map_with_negative_block_count() {
        // count = -1 (one entry), block byte size, entry, terminator.
        let mut buf = Vec::new();
        write_long(&mut buf, -1);
        let mut entry = Vec::new();
        write_str(&mut entry, "k");
        write_bytes(&mut entry, b"v");
        write_long(&mut buf, entry.len() as i64);
        buf.extend_from_slice(&entry);
        write_long(&mut buf, 0);

        let mut cur = WireCursor::new(&buf);
        let map = cur.read_bytes_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["k"], Bytes::from_static(b"v"));
    }

    proptest! {
        #[test]
        fn prop_long_round_trip(value in any::<i64>()) {
            let mut buf = Vec::new();
            write_long(&mut buf, value);
            prop_assert!(buf.len() <= MAX_VARINT_LEN);

            let mut cur = WireCursor::new(&buf);
            prop_assert_eq!(cur.read_long().unwrap(), value);
            prop_assert_eq!(cur.remaining(), 0);
        }

        #[test]
        fn prop_bytes_map_round_trip(
            entries in prop::collection::hash_map(".{0,8}", prop::collection::vec(any::<u8>(), 0..32), 0..8)
        ) {
            let map: HashMap<String, Bytes> =
                entries.into_iter().map(|(k, v)| (k, Bytes::from(v))).collect();

            let mut buf = Vec::new();
            write_bytes_map(&mut buf, &map);

            let mut cur = WireCursor::new(&buf);
            prop_assert_eq!(cur.read_bytes_map().unwrap(), map);
            prop_assert_eq!(cur.remaining(), 0);
        }

        #[test]
        fn prop_str_round_trip(value in ".{0,64}") {
            let mut buf = Vec::new();
            write_str(&mut buf, &value);

            let mut cur = WireCursor::new(&buf);
            prop_assert_eq!(cur.read_str().unwrap(), value);
        }
    }
}
