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

//! Map iterators
//!
//! Iterators visit segments in order. Entering a segment snapshots its
//! `(index, leaf_recid)` pairs under a short read lock; each leaf is then
//! loaded under the read lock re-acquired for it, and skipped if the index
//! tree no longer maps its index to the snapshotted recid (the leaf was
//! removed or rewritten in the meantime). Within a leaf, entries come out
//! in insertion order. No atomicity is promised across leaves.
//!
//! [`Iter::remove_last`] removes the most recently yielded key by
//! re-entering the map, mirroring a cursor-style `remove`.

use std::collections::VecDeque;

use crate::core::{Error, Result};
use crate::map::ShardMap;

/// Iterator over `(key, value)` pairs
pub struct Iter<'a, K, V> {
    map: &'a ShardMap<K, V>,
    segment: usize,
    /// `(index, leaf_recid)` pairs still to visit in the current segment
    pending: VecDeque<(u64, u64)>,
    current: std::vec::IntoIter<(K, V)>,
    last_key: Option<K>,
    failed: bool,
}

impl<'a, K, V> Iter<'a, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(map: &'a ShardMap<K, V>) -> Self {
        let pending = Self::snapshot(map, 0);
        Iter {
            map,
            segment: 0,
            pending,
            current: Vec::new().into_iter(),
            last_key: None,
            failed: false,
        }
    }

    fn snapshot(map: &ShardMap<K, V>, segment: usize) -> VecDeque<(u64, u64)> {
        let mut pending = VecDeque::new();
        let seg = map.segments[segment].read();
        seg.index_tree
            .for_each(&mut |index, leaf_recid| pending.push_back((index, leaf_recid)));
        pending
    }

    /// Load one leaf under the segment's read lock, or `None` if it is no
    /// longer reachable under the snapshotted recid
    fn load(&self, index: u64, leaf_recid: u64) -> Result<Option<Vec<(K, V)>>> {
        let seg = self.map.segments[self.segment].read();
        if seg.index_tree.get(index) != leaf_recid {
            return Ok(None);
        }
        let store = self.map.store(self.segment);
        let leaf = self.map.load_leaf(store, leaf_recid)?;
        let mut entries = Vec::with_capacity(leaf.len());
        for entry in &leaf {
            entries.push((
                entry.key.clone(),
                self.map.unwrap_value(store, &entry.value)?,
            ));
        }
        Ok(Some(entries))
    }

    /// Remove the most recently yielded entry from the map. Errors with an
    /// illegal state if `next` has not been called since the last removal.
    pub fn remove_last(&mut self) -> Result<bool> {
        match self.last_key.take() {
            Some(key) => self.map.remove_present(&key),
            None => Err(Error::illegal_state(
                "iterator remove without a preceding next",
            )),
        }
    }
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(pair) = self.current.next() {
                self.last_key = Some(pair.0.clone());
                return Some(Ok(pair));
            }
            if let Some((index, leaf_recid)) = self.pending.pop_front() {
                match self.load(index, leaf_recid) {
                    Ok(Some(entries)) => self.current = entries.into_iter(),
                    Ok(None) => {}
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
                continue;
            }
            self.segment += 1;
            if self.segment >= self.map.segments.len() {
                return None;
            }
            self.pending = Self::snapshot(self.map, self.segment);
        }
    }
}

/// Iterator over keys
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Keys<'a, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(map: &'a ShardMap<K, V>) -> Self {
        Keys {
            inner: Iter::new(map),
        }
    }

    /// Remove the most recently yielded key from the map
    pub fn remove_last(&mut self) -> Result<bool> {
        self.inner.remove_last()
    }
}

impl<K, V> Iterator for Keys<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map(|(key, _)| key))
    }
}

/// Iterator over values
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<'a, K, V> Values<'a, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(map: &'a ShardMap<K, V>) -> Self {
        Values {
            inner: Iter::new(map),
        }
    }
}

impl<K, V> Iterator for Values<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use crate::core::codec::{I64Codec, StrCodec};
    use crate::map::ShardMap;

    fn map_with(entries: &[(&str, i64)]) -> std::sync::Arc<ShardMap<String, i64>> {
        let map = ShardMap::builder()
            .geometry(2, 4, 2)
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .build()
            .unwrap();
        for (key, value) in entries {
            map.put(key.to_string(), *value).unwrap();
        }
        map
    }

    #[test]
    fn test_iter_yields_every_entry_once() {
        let map = map_with(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let mut seen: Vec<(String, i64)> = map.iter().map(|item| item.unwrap()).collect();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("c".to_string(), 3),
                ("d".to_string(), 4)
            ]
        );
    }

    #[test]
    fn test_empty_map_iterates_nothing() {
        let map = map_with(&[]);
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn test_keys_and_values() {
        let map = map_with(&[("a", 1), ("b", 2)]);
        let mut keys: Vec<String> = map.keys().map(|item| item.unwrap()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        let mut values: Vec<i64> = map.values().map(|item| item.unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_remove_last() {
        let map = map_with(&[("a", 1), ("b", 2)]);
        let mut iter = map.iter();
        let (first, _) = iter.next().unwrap().unwrap();
        assert!(iter.remove_last().unwrap());
        // A second remove without an intervening next is an illegal state
        assert!(iter.remove_last().is_err());
        drop(iter);
        assert_eq!(map.len().unwrap(), 1);
        assert!(!map.contains_key(&first).unwrap());
    }

    #[test]
    fn test_remove_before_next_is_illegal() {
        let map = map_with(&[("a", 1)]);
        let mut iter = map.iter();
        assert!(iter.remove_last().is_err());
    }

    #[test]
    fn test_iteration_skips_concurrently_removed_leaf() {
        let map = map_with(&[("a", 1), ("b", 2), ("c", 3)]);
        let mut iter = map.iter();
        let first = iter.next().unwrap().unwrap();
        // Remove the remaining entries mid-iteration; stale snapshot
        // entries must be skipped, not produce errors
        for key in ["a", "b", "c"] {
            if key != first.0 {
                map.remove(&key.to_string()).unwrap();
            }
        }
        for item in iter {
            item.unwrap();
        }
    }
}
