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

//! Leaf records and their wire format
//!
//! A leaf holds every collision for one `(segment, index)` bucket as an
//! ordered sequence of `(key, value, expire_id)` triples. On the wire a
//! leaf is `pack(3 * entries)` followed by one encoded triple per entry;
//! the value slot depends on the format:
//!
//! - inline values: the value's own encoding
//! - external values: `pack(value_recid)`
//! - key set: nothing (the present-marker is synthesized on read)
//!
//! Empty leaves are never written; a leaf is deleted from the store when
//! its last triple is removed.

use smallvec::SmallVec;

use crate::core::codec::{pack_u64, unpack_u64, Codec};
use crate::core::{Error, Result};

/// How leaf records carry their values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafFormat {
    /// Values encoded directly in the leaf
    InlineValues,
    /// Values live in their own records; the leaf stores recids
    ExternalValues,
    /// No values at all; the map is a key set
    KeySet,
}

/// Value slot of a leaf triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ValueRef<V> {
    Inline(V),
    External(u64),
}

impl<V> ValueRef<V> {
    pub fn as_inline(&self) -> Option<&V> {
        match self {
            ValueRef::Inline(v) => Some(v),
            ValueRef::External(_) => None,
        }
    }

    pub fn external_recid(&self) -> Option<u64> {
        match self {
            ValueRef::Inline(_) => None,
            ValueRef::External(recid) => Some(*recid),
        }
    }
}

/// One `(key, value, expire_id)` triple
#[derive(Debug, Clone)]
pub(crate) struct LeafEntry<K, V> {
    pub key: K,
    pub value: ValueRef<V>,
    /// 0 when the entry has no expiration-queue node
    pub expire_id: u64,
}

/// Decoded leaf; single-entry leaves are the common case
pub(crate) type Leaf<K, V> = SmallVec<[LeafEntry<K, V>; 1]>;

/// Encode a leaf for storage
pub(crate) fn encode_leaf<K, V>(
    format: LeafFormat,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
    leaf: &Leaf<K, V>,
    out: &mut Vec<u8>,
) -> Result<()> {
    pack_u64(out, 3 * leaf.len() as u64);
    for entry in leaf {
        key_codec.encode(out, &entry.key)?;
        match (format, &entry.value) {
            (LeafFormat::InlineValues, ValueRef::Inline(v)) => value_codec.encode(out, v)?,
            (LeafFormat::ExternalValues, ValueRef::External(recid)) => pack_u64(out, *recid),
            (LeafFormat::KeySet, ValueRef::Inline(_)) => {}
            _ => {
                return Err(Error::internal(
                    "leaf entry value slot does not match the leaf format",
                ))
            }
        }
        pack_u64(out, entry.expire_id);
    }
    Ok(())
}

/// Decode a leaf record
pub(crate) fn decode_leaf<K, V>(
    format: LeafFormat,
    key_codec: &dyn Codec<K>,
    value_codec: &dyn Codec<V>,
    data: &[u8],
) -> Result<Leaf<K, V>> {
    let mut input = data;
    let size = unpack_u64(&mut input)?;
    if size == 0 || size % 3 != 0 {
        return Err(Error::corruption(format!(
            "leaf size {} is not a positive multiple of three",
            size
        )));
    }
    let entries = (size / 3) as usize;
    let mut leaf = Leaf::with_capacity(entries);
    for _ in 0..entries {
        let key = key_codec.decode(&mut input)?;
        let value = match format {
            LeafFormat::InlineValues => ValueRef::Inline(value_codec.decode(&mut input)?),
            LeafFormat::ExternalValues => {
                let recid = unpack_u64(&mut input)?;
                if recid == 0 {
                    return Err(Error::corruption("leaf references value recid 0"));
                }
                ValueRef::External(recid)
            }
            // Synthesize the present-marker from the sentinel codec
            LeafFormat::KeySet => {
                let mut empty: &[u8] = &[];
                ValueRef::Inline(value_codec.decode(&mut empty)?)
            }
        };
        let expire_id = unpack_u64(&mut input)?;
        leaf.push(LeafEntry {
            key,
            value,
            expire_id,
        });
    }
    if !input.is_empty() {
        return Err(Error::corruption(format!(
            "leaf record has {} trailing bytes",
            input.len()
        )));
    }
    Ok(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{I64Codec, StrCodec, UnitCodec};

    fn entry(key: &str, value: ValueRef<i64>, expire_id: u64) -> LeafEntry<String, i64> {
        LeafEntry {
            key: key.to_string(),
            value,
            expire_id,
        }
    }

    #[test]
    fn test_inline_roundtrip() {
        let leaf: Leaf<String, i64> = Leaf::from_vec(vec![
            entry("a", ValueRef::Inline(1), 0),
            entry("b", ValueRef::Inline(-7), (9 << 2) | 1),
        ]);
        let mut buf = Vec::new();
        encode_leaf(LeafFormat::InlineValues, &StrCodec, &I64Codec, &leaf, &mut buf).unwrap();
        let decoded =
            decode_leaf::<String, i64>(LeafFormat::InlineValues, &StrCodec, &I64Codec, &buf)
                .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key, "a");
        assert_eq!(decoded[0].value, ValueRef::Inline(1));
        assert_eq!(decoded[1].expire_id, (9 << 2) | 1);
    }

    #[test]
    fn test_external_roundtrip() {
        let leaf: Leaf<String, i64> = Leaf::from_vec(vec![
            entry("k", ValueRef::External(17), 0),
        ]);
        let mut buf = Vec::new();
        encode_leaf(
            LeafFormat::ExternalValues,
            &StrCodec,
            &I64Codec,
            &leaf,
            &mut buf,
        )
        .unwrap();
        let decoded =
            decode_leaf::<String, i64>(LeafFormat::ExternalValues, &StrCodec, &I64Codec, &buf)
                .unwrap();
        assert_eq!(decoded[0].value, ValueRef::External(17));
    }

    #[test]
    fn test_keyset_roundtrip() {
        let leaf: Leaf<String, ()> = Leaf::from_vec(vec![LeafEntry {
            key: "member".to_string(),
            value: ValueRef::Inline(()),
            expire_id: 0,
        }]);
        let mut buf = Vec::new();
        encode_leaf(LeafFormat::KeySet, &StrCodec, &UnitCodec, &leaf, &mut buf).unwrap();
        let decoded =
            decode_leaf::<String, ()>(LeafFormat::KeySet, &StrCodec, &UnitCodec, &buf).unwrap();
        assert_eq!(decoded[0].key, "member");
        assert_eq!(decoded[0].value, ValueRef::Inline(()));
    }

    #[test]
    fn test_rejects_bad_size() {
        // size 4 is not a multiple of three
        let mut buf = Vec::new();
        pack_u64(&mut buf, 4);
        assert!(
            decode_leaf::<String, i64>(LeafFormat::InlineValues, &StrCodec, &I64Codec, &buf)
                .is_err()
        );
        // size 0 means an empty leaf, which must never be stored
        let mut buf = Vec::new();
        pack_u64(&mut buf, 0);
        assert!(
            decode_leaf::<String, i64>(LeafFormat::InlineValues, &StrCodec, &I64Codec, &buf)
                .is_err()
        );
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let leaf: Leaf<String, i64> = Leaf::from_vec(vec![entry("a", ValueRef::Inline(1), 0)]);
        let mut buf = Vec::new();
        encode_leaf(LeafFormat::InlineValues, &StrCodec, &I64Codec, &leaf, &mut buf).unwrap();
        buf.push(0xee);
        assert!(
            decode_leaf::<String, i64>(LeafFormat::InlineValues, &StrCodec, &I64Codec, &buf)
                .is_err()
        );
    }

    #[test]
    fn test_rejects_value_recid_zero() {
        let mut buf = Vec::new();
        pack_u64(&mut buf, 3);
        StrCodec.encode(&mut buf, &"k".to_string()).unwrap();
        pack_u64(&mut buf, 0); // value recid
        pack_u64(&mut buf, 0); // expire id
        assert!(
            decode_leaf::<String, i64>(LeafFormat::ExternalValues, &StrCodec, &I64Codec, &buf)
                .is_err()
        );
    }
}
