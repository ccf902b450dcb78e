// Copyright 2025 Shardmap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Serialization seam for keys and values
//!
//! Every record that reaches a [`crate::store::Store`] goes through a
//! [`Codec`]: leaf records, external value records and queue nodes. Codecs
//! also carry the default [`HashOps`] for their type, so a map built from
//! codecs alone hashes sensibly.
//!
//! Sizes, recids and expire ids are written with LEB128 varints
//! ([`pack_u64`] / [`unpack_u64`]); fixed-width integers use little-endian
//! bytes.

use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::core::hash::{DefaultHashOps, HashOps};

/// Serializer/deserializer for a single type
///
/// `decode` consumes from the front of the input slice; leftover bytes are
/// the caller's concern (leaf records hold several codec payloads in a row).
pub trait Codec<T>: Send + Sync {
    /// Append the serialized form of `value` to `out`
    fn encode(&self, out: &mut Vec<u8>, value: &T) -> Result<()>;

    /// Decode one value from the front of `input`, advancing it
    fn decode(&self, input: &mut &[u8]) -> Result<T>;

    /// True if this codec never produces malformed output for any value it
    /// accepted, so records it wrote can be decoded without defensive copies
    fn is_trusted(&self) -> bool {
        false
    }

    /// Default hashing and equality for this codec's type
    fn hash_ops(&self) -> Arc<dyn HashOps<T>>;
}

/// Append `value` as an LEB128 varint
pub fn pack_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an LEB128 varint from the front of `input`, advancing it
pub fn unpack_u64(input: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in input.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::corruption("varint longer than 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            *input = &input[i + 1..];
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::corruption("truncated varint"))
}

// Takes exactly `n` bytes from the front of `$input`, advancing it. A macro
// rather than a function so the returned borrow comes from the caller's
// slice instead of a function-local reborrow.
macro_rules! take_bytes {
    ($input:expr, $n:expr, $what:expr) => {{
        let n = $n;
        let whole: &[u8] = *$input;
        if whole.len() < n {
            return Err(Error::corruption(format!("truncated {}", $what)));
        }
        let (head, rest) = whole.split_at(n);
        *$input = rest;
        head
    }};
}

/// Codec for `i64` as 8 little-endian bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl Codec<i64> for I64Codec {
    fn encode(&self, out: &mut Vec<u8>, value: &i64) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn decode(&self, input: &mut &[u8]) -> Result<i64> {
        let bytes = take_bytes!(input, 8, "i64");
        Ok(i64::from_le_bytes(bytes.try_into().map_err(|_| {
            Error::corruption("i64 slice length mismatch")
        })?))
    }

    fn is_trusted(&self) -> bool {
        true
    }

    fn hash_ops(&self) -> Arc<dyn HashOps<i64>> {
        Arc::new(DefaultHashOps::new())
    }
}

/// Codec for `u64` as an LEB128 varint
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, out: &mut Vec<u8>, value: &u64) -> Result<()> {
        pack_u64(out, *value);
        Ok(())
    }

    fn decode(&self, input: &mut &[u8]) -> Result<u64> {
        unpack_u64(input)
    }

    fn is_trusted(&self) -> bool {
        true
    }

    fn hash_ops(&self) -> Arc<dyn HashOps<u64>> {
        Arc::new(DefaultHashOps::new())
    }
}

/// Codec for `String` as a varint length prefix plus UTF-8 bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct StrCodec;

impl Codec<String> for StrCodec {
    fn encode(&self, out: &mut Vec<u8>, value: &String) -> Result<()> {
        pack_u64(out, value.len() as u64);
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, input: &mut &[u8]) -> Result<String> {
        let len = unpack_u64(input)? as usize;
        let bytes = take_bytes!(input, len, "string payload");
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::corruption("string payload is not valid UTF-8"))
    }

    fn is_trusted(&self) -> bool {
        true
    }

    fn hash_ops(&self) -> Arc<dyn HashOps<String>> {
        Arc::new(DefaultHashOps::new())
    }
}

/// Codec for `Vec<u8>` as a varint length prefix plus raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, out: &mut Vec<u8>, value: &Vec<u8>) -> Result<()> {
        pack_u64(out, value.len() as u64);
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, input: &mut &[u8]) -> Result<Vec<u8>> {
        let len = unpack_u64(input)? as usize;
        let bytes = take_bytes!(input, len, "bytes payload");
        Ok(bytes.to_vec())
    }

    fn is_trusted(&self) -> bool {
        true
    }

    fn hash_ops(&self) -> Arc<dyn HashOps<Vec<u8>>> {
        Arc::new(DefaultHashOps::new())
    }
}

/// Sentinel codec for the key-set present-marker
///
/// Encodes nothing and decodes `()` from zero bytes. A map built in key-set
/// mode uses this as its value codec; leaf records in that mode carry no
/// value bytes at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitCodec;

impl Codec<()> for UnitCodec {
    fn encode(&self, _out: &mut Vec<u8>, _value: &()) -> Result<()> {
        Ok(())
    }

    fn decode(&self, _input: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn is_trusted(&self) -> bool {
        true
    }

    fn hash_ops(&self) -> Arc<dyn HashOps<()>> {
        Arc::new(DefaultHashOps::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_u64(v: u64) -> u64 {
        let mut buf = Vec::new();
        pack_u64(&mut buf, v);
        let mut slice = &buf[..];
        let got = unpack_u64(&mut slice).unwrap();
        assert!(slice.is_empty(), "varint left trailing bytes");
        got
    }

    #[test]
    fn test_varint_roundtrip() {
        for v in [0, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(roundtrip_u64(v), v);
        }
    }

    #[test]
    fn test_varint_sizes() {
        let mut buf = Vec::new();
        pack_u64(&mut buf, 127);
        assert_eq!(buf.len(), 1);
        buf.clear();
        pack_u64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
        buf.clear();
        pack_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_varint_truncated() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(unpack_u64(&mut slice).is_err());
    }

    #[test]
    fn test_varint_overlong() {
        let mut slice: &[u8] = &[0x80; 11];
        assert!(unpack_u64(&mut slice).is_err());
    }

    #[test]
    fn test_i64_codec_roundtrip() {
        let codec = I64Codec;
        for v in [0i64, 1, -1, i64::MIN, i64::MAX, 123_456_789] {
            let mut buf = Vec::new();
            codec.encode(&mut buf, &v).unwrap();
            assert_eq!(buf.len(), 8);
            let mut slice = &buf[..];
            assert_eq!(codec.decode(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_str_codec_roundtrip() {
        let codec = StrCodec;
        for v in ["", "a", "hello world", "ünïcödé ✓"] {
            let v = v.to_string();
            let mut buf = Vec::new();
            codec.encode(&mut buf, &v).unwrap();
            let mut slice = &buf[..];
            assert_eq!(codec.decode(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_str_codec_rejects_bad_utf8() {
        let codec = StrCodec;
        let mut buf = Vec::new();
        pack_u64(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        let mut slice = &buf[..];
        assert!(codec.decode(&mut slice).is_err());
    }

    #[test]
    fn test_bytes_codec_roundtrip() {
        let codec = BytesCodec;
        let v = vec![1u8, 2, 3, 0, 255];
        let mut buf = Vec::new();
        codec.encode(&mut buf, &v).unwrap();
        let mut slice = &buf[..];
        assert_eq!(codec.decode(&mut slice).unwrap(), v);
    }

    #[test]
    fn test_unit_codec_is_empty() {
        let codec = UnitCodec;
        let mut buf = Vec::new();
        codec.encode(&mut buf, &()).unwrap();
        assert!(buf.is_empty());
        let mut slice: &[u8] = &[];
        codec.decode(&mut slice).unwrap();
    }

    #[test]
    fn test_sequential_decode() {
        // Two values back to back in one buffer, as leaf records store them
        let mut buf = Vec::new();
        StrCodec.encode(&mut buf, &"key".to_string()).unwrap();
        I64Codec.encode(&mut buf, &42).unwrap();
        let mut slice = &buf[..];
        assert_eq!(StrCodec.decode(&mut slice).unwrap(), "key");
        assert_eq!(I64Codec.decode(&mut slice).unwrap(), 42);
        assert!(slice.is_empty());
    }
}
