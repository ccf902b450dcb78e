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

//! Map construction
//!
//! [`Builder`] collects geometry, codecs, expiration settings and
//! collaborators, validates the combination and produces an
//! `Arc<ShardMap>`. Everything is immutable after construction.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::core::codec::Codec;
use crate::core::hash::HashOps;
use crate::core::{Error, Result};
use crate::map::index_tree::IndexTree;
use crate::map::leaf::LeafFormat;
use crate::map::queue::ExpireQueue;
use crate::map::{ModificationListener, Segment, ShardMap, ValueLoader, EXPIRE_NEVER};
use crate::store::{MemStore, Store};

/// Builder for [`ShardMap`]
///
/// Geometry defaults to 8 segments (`conc_shift = 3`) of `16^2 = 256`
/// indices each (`dir_shift = 4`, `levels = 2`). Key and value codecs are
/// mandatory; hashers default to the codecs' [`Codec::hash_ops`]. With no
/// explicit stores, each segment gets its own [`MemStore`].
pub struct Builder<K, V> {
    conc_shift: u32,
    dir_shift: u32,
    levels: u32,
    hash_seed: u32,
    value_inline: bool,
    has_values: bool,
    thread_safe: bool,
    expire_create_ttl: i64,
    expire_update_ttl: i64,
    expire_get_ttl: i64,
    expire_max_size: u64,
    expire_store_size: u64,
    expire_compact_threshold: Option<f64>,
    expire_executor_period: Option<Duration>,
    counters: bool,
    key_codec: Option<Arc<dyn Codec<K>>>,
    value_codec: Option<Arc<dyn Codec<V>>>,
    key_hash: Option<Arc<dyn HashOps<K>>>,
    value_hash: Option<Arc<dyn HashOps<V>>>,
    stores: Option<Vec<Arc<dyn Store>>>,
    listeners: Vec<Arc<dyn ModificationListener<K, V>>>,
    value_loader: Option<Arc<ValueLoader<K, V>>>,
}

impl<K, V> Builder<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a builder with default settings
    pub fn new() -> Self {
        Builder {
            conc_shift: 3,
            dir_shift: 4,
            levels: 2,
            hash_seed: 0,
            value_inline: true,
            has_values: true,
            thread_safe: true,
            expire_create_ttl: 0,
            expire_update_ttl: 0,
            expire_get_ttl: 0,
            expire_max_size: 0,
            expire_store_size: 0,
            expire_compact_threshold: None,
            expire_executor_period: None,
            counters: false,
            key_codec: None,
            value_codec: None,
            key_hash: None,
            value_hash: None,
            stores: None,
            listeners: Vec::new(),
            value_loader: None,
        }
    }

    /// Set the hash geometry: `1 << conc_shift` segments, each addressing
    /// `(1 << dir_shift) ^ levels` indices
    pub fn geometry(mut self, conc_shift: u32, dir_shift: u32, levels: u32) -> Self {
        self.conc_shift = conc_shift;
        self.dir_shift = dir_shift;
        self.levels = levels;
        self
    }

    /// Seed for structural content hashing. Bucket routing always hashes
    /// with seed 0 regardless of this setting.
    pub fn hash_seed(mut self, seed: u32) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Store each value in its own record instead of inline in the leaf
    pub fn external_values(mut self) -> Self {
        self.value_inline = false;
        self
    }

    /// Build a key set: no values, the value codec is the present-marker
    /// sentinel and values are always inline
    pub fn key_set(mut self) -> Self {
        self.has_values = false;
        self
    }

    /// Declare the map single-threaded. Locks are kept (uncontended
    /// acquisition is cheap) but the store may skip its own checks.
    pub fn thread_unsafe(mut self) -> Self {
        self.thread_safe = false;
        self
    }

    /// TTL in milliseconds after entry creation; [`EXPIRE_NEVER`] queues
    /// the entry without a deadline, `0` disables the CREATE queue
    pub fn expire_create_ttl(mut self, millis: i64) -> Self {
        self.expire_create_ttl = millis;
        self
    }

    /// TTL in milliseconds after entry update
    pub fn expire_update_ttl(mut self, millis: i64) -> Self {
        self.expire_update_ttl = millis;
        self
    }

    /// TTL in milliseconds after entry access
    pub fn expire_get_ttl(mut self, millis: i64) -> Self {
        self.expire_get_ttl = millis;
        self
    }

    /// Cap the entry count across the whole map; `0` disables. Enables
    /// per-segment counters. The cap is approximate across segments.
    pub fn expire_max_size(mut self, max_size: u64) -> Self {
        self.expire_max_size = max_size;
        self
    }

    /// Cap the per-segment store size in bytes; `0` disables. Requires
    /// stores that report sizes.
    pub fn expire_store_size(mut self, bytes: u64) -> Self {
        self.expire_store_size = bytes;
        self
    }

    /// Compact a segment's store when `free / total` exceeds this fraction
    /// after a sweep. Must be in `(0, 1)`.
    pub fn expire_compact_threshold(mut self, fraction: f64) -> Self {
        self.expire_compact_threshold = Some(fraction);
        self
    }

    /// Run eviction on a background thread at this fixed per-segment rate
    /// instead of inline in user operations
    pub fn expire_executor(mut self, period: Duration) -> Self {
        self.expire_executor_period = Some(period);
        self
    }

    /// Maintain a persisted per-segment entry counter, making `len` O(1)
    pub fn enable_counters(mut self) -> Self {
        self.counters = true;
        self
    }

    /// Key codec (mandatory)
    pub fn key_codec(mut self, codec: impl Codec<K> + 'static) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    /// Value codec (mandatory; use [`crate::UnitCodec`] for key sets)
    pub fn value_codec(mut self, codec: impl Codec<V> + 'static) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }

    /// Override the key hasher (defaults to the key codec's)
    pub fn key_hash_ops(mut self, ops: impl HashOps<K> + 'static) -> Self {
        self.key_hash = Some(Arc::new(ops));
        self
    }

    /// Override the value hasher (defaults to the value codec's)
    pub fn value_hash_ops(mut self, ops: impl HashOps<V> + 'static) -> Self {
        self.value_hash = Some(Arc::new(ops));
        self
    }

    /// Supply the per-segment stores. The vector length must equal the
    /// segment count; entries may alias the same store.
    pub fn stores(mut self, stores: Vec<Arc<dyn Store>>) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Register a modification listener
    pub fn listener(mut self, listener: impl ModificationListener<K, V> + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Install a value loader consulted by `get` on a miss
    pub fn value_loader(mut self, loader: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        self.value_loader = Some(Arc::new(loader));
        self
    }

    /// Validate the configuration and build the map
    pub fn build(mut self) -> Result<Arc<ShardMap<K, V>>> {
        let key_codec = self
            .key_codec
            .take()
            .ok_or_else(|| Error::invalid_argument("key codec is required"))?;
        let value_codec = self
            .value_codec
            .take()
            .ok_or_else(|| Error::invalid_argument("value codec is required"))?;

        if self.conc_shift > 16 {
            return Err(Error::invalid_argument("conc_shift must be at most 16"));
        }
        if self.dir_shift == 0 || self.dir_shift > 16 {
            return Err(Error::invalid_argument("dir_shift must be in 1..=16"));
        }
        if self.levels == 0 || self.dir_shift * self.levels > 48 {
            return Err(Error::invalid_argument(
                "levels must be positive and dir_shift * levels at most 48",
            ));
        }
        for (name, ttl) in [
            ("expire_create_ttl", self.expire_create_ttl),
            ("expire_update_ttl", self.expire_update_ttl),
            ("expire_get_ttl", self.expire_get_ttl),
        ] {
            if ttl < EXPIRE_NEVER {
                return Err(Error::invalid_argument(format!(
                    "{} must be non-negative or EXPIRE_NEVER",
                    name
                )));
            }
        }
        if let Some(threshold) = self.expire_compact_threshold {
            if !(threshold > 0.0 && threshold < 1.0) {
                return Err(Error::invalid_argument(
                    "compact threshold must be a fraction in (0, 1)",
                ));
            }
        }
        if let Some(period) = self.expire_executor_period {
            if period.is_zero() {
                return Err(Error::invalid_argument("executor period must be positive"));
            }
            if !self.thread_safe {
                return Err(Error::invalid_argument(
                    "a background eviction executor requires a thread-safe map",
                ));
            }
        }

        let format = if !self.has_values {
            if !self.value_inline {
                return Err(Error::invalid_argument(
                    "a key set cannot use external values",
                ));
            }
            LeafFormat::KeySet
        } else if self.value_inline {
            LeafFormat::InlineValues
        } else {
            LeafFormat::ExternalValues
        };

        // Size and store caps purge through a queue; without any TTL the
        // CREATE queue is enabled with the never-expires sentinel.
        if (self.expire_max_size != 0 || self.expire_store_size != 0)
            && self.expire_create_ttl == 0
            && self.expire_update_ttl == 0
            && self.expire_get_ttl == 0
        {
            self.expire_create_ttl = EXPIRE_NEVER;
        }
        // The entry-count cap reads the counters
        let counters = self.counters || self.expire_max_size != 0;

        let segment_count = 1usize << self.conc_shift;
        let stores: Vec<Arc<dyn Store>> = match self.stores.take() {
            Some(stores) => {
                if stores.len() != segment_count {
                    return Err(Error::invalid_argument(format!(
                        "{} stores supplied for {} segments",
                        stores.len(),
                        segment_count
                    )));
                }
                stores
            }
            None => (0..segment_count)
                .map(|_| Arc::new(MemStore::new()) as Arc<dyn Store>)
                .collect(),
        };
        if self.expire_store_size != 0 {
            for store in &stores {
                if store.file_tail().is_none() || store.free_size().is_none() {
                    return Err(Error::invalid_argument(
                        "expire_store_size requires stores that report sizes",
                    ));
                }
            }
        }

        let level_bits = self.levels * self.dir_shift;
        let index_mask = if level_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << level_bits) - 1
        };
        let seg_mask = ((1u64 << self.conc_shift) - 1) as u32;

        // 32-bit hashes cannot spread past 2^31-ish buckets; warn once and
        // proceed with the upper geometry going unused.
        let addressable = (segment_count as u128) << level_bits;
        if addressable > (1u128 << 31) + 1000 {
            eprintln!(
                "Warning: hash geometry addresses {} buckets, beyond the reach of 32-bit hashes",
                addressable
            );
        }

        let mut segments = Vec::with_capacity(segment_count);
        for store in stores.iter().take(segment_count) {
            let counter_recid = if counters {
                store.put(&0i64.to_le_bytes())?
            } else {
                0
            };
            segments.push(RwLock::new(Segment {
                index_tree: IndexTree::new(self.dir_shift, self.levels),
                create_queue: (self.expire_create_ttl != 0).then(ExpireQueue::new),
                update_queue: (self.expire_update_ttl != 0).then(ExpireQueue::new),
                get_queue: (self.expire_get_ttl != 0).then(ExpireQueue::new),
                counter_recid,
            }));
        }

        let has_queues = self.expire_create_ttl != 0
            || self.expire_update_ttl != 0
            || self.expire_get_ttl != 0;

        let key_hash = match self.key_hash.take() {
            Some(ops) => ops,
            None => key_codec.hash_ops(),
        };
        let value_hash = match self.value_hash.take() {
            Some(ops) => ops,
            None => value_codec.hash_ops(),
        };

        let map = Arc::new(ShardMap {
            conc_shift: self.conc_shift,
            level_bits,
            index_mask,
            seg_mask,
            hash_seed: self.hash_seed,
            format,
            has_values: self.has_values,
            expire_create_ttl: self.expire_create_ttl,
            expire_update_ttl: self.expire_update_ttl,
            expire_get_ttl: self.expire_get_ttl,
            expire_max_size: self.expire_max_size,
            expire_store_size: self.expire_store_size,
            expire_compact_threshold: self.expire_compact_threshold,
            has_queues,
            executor_attached: self.expire_executor_period.is_some(),
            key_codec,
            value_codec,
            key_hash,
            value_hash,
            stores,
            segments,
            listeners: std::mem::take(&mut self.listeners),
            value_loader: self.value_loader.take(),
            hash_checked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            executor: Mutex::new(None),
        });

        if let Some(period) = self.expire_executor_period {
            map.start_executor(period);
        }
        Ok(map)
    }
}

impl<K, V> Default for Builder<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{I64Codec, StrCodec, UnitCodec};

    #[test]
    fn test_codecs_required() {
        let err = Builder::<String, i64>::new().build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = Builder::<String, i64>::new()
            .key_codec(StrCodec)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_geometry_validation() {
        let build = |conc, dir, levels| {
            Builder::<String, i64>::new()
                .geometry(conc, dir, levels)
                .key_codec(StrCodec)
                .value_codec(I64Codec)
                .build()
        };
        assert!(build(17, 4, 2).is_err());
        assert!(build(2, 0, 2).is_err());
        assert!(build(2, 4, 0).is_err());
        assert!(build(2, 16, 4).is_err());
        assert!(build(2, 4, 2).is_ok());
    }

    #[test]
    fn test_ttl_validation() {
        let err = Builder::<String, i64>::new()
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .expire_create_ttl(-2)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_compact_threshold_validation() {
        for bad in [0.0, 1.0, -0.5, 1.5] {
            let err = Builder::<String, i64>::new()
                .key_codec(StrCodec)
                .value_codec(I64Codec)
                .expire_compact_threshold(bad)
                .build()
                .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_keyset_rejects_external_values() {
        let err = Builder::<String, ()>::new()
            .key_codec(StrCodec)
            .value_codec(UnitCodec)
            .key_set()
            .external_values()
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_mis_sized_store_array_rejected() {
        let stores: Vec<Arc<dyn Store>> = vec![Arc::new(MemStore::new())];
        let err = Builder::<String, i64>::new()
            .geometry(2, 4, 2) // 4 segments
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .stores(stores)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_max_size_enables_counters_and_create_queue() {
        let map = Builder::<String, i64>::new()
            .geometry(1, 4, 2)
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .expire_max_size(10)
            .build()
            .unwrap();
        assert_eq!(map.expire_create_ttl, EXPIRE_NEVER);
        assert!(map.has_queues);
        let seg = map.segments[0].read();
        assert!(seg.create_queue.is_some());
        assert_ne!(seg.counter_recid, 0);
    }

    #[test]
    fn test_aliased_stores_allowed() {
        let shared: Arc<dyn Store> = Arc::new(MemStore::new());
        let stores = vec![Arc::clone(&shared), Arc::clone(&shared)];
        let map = Builder::<String, i64>::new()
            .geometry(1, 4, 2)
            .key_codec(StrCodec)
            .value_codec(I64Codec)
            .stores(stores)
            .build()
            .unwrap();
        map.put("a".to_string(), 1).unwrap();
        assert_eq!(map.get(&"a".to_string()).unwrap(), Some(1));
    }
}
