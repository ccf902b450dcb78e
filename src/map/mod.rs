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

//! The segmented map
//!
//! [`ShardMap`] routes each key through a 32-bit hash: the low
//! `levels * dir_shift` bits select an index inside a segment's sparse
//! index tree, the next `conc_shift` bits select the segment. Each segment
//! owns an index tree, up to three expiration queues, an optional persisted
//! counter and a reader/writer lock; leaf records live in the segment's
//! store.
//!
//! # Locking
//!
//! Operations touch exactly one segment and hold its lock for the whole
//! critical section. `get` runs under the read lock only when it cannot
//! mutate anything: no GET queue, no value loader, and no chance of
//! foreground eviction. Everything else takes the write lock. Global
//! operations (`len`, `clear`, `verify`, iteration) visit segments one at
//! a time; `close` briefly holds every segment lock at once.

pub mod config;
pub(crate) mod expire;
pub(crate) mod index_tree;
pub mod iter;
pub(crate) mod leaf;
pub(crate) mod queue;
mod verify;

pub use config::Builder;
pub use iter::{Iter, Keys, Values};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::codec::Codec;
use crate::core::hash::HashOps;
use crate::core::{Error, Result};
use crate::map::expire::{
    expire_node_recid, expire_tag, expire_timestamp, make_expire_id, EvictionExecutor, QueueTag,
};
use crate::map::index_tree::IndexTree;
use crate::map::leaf::{decode_leaf, encode_leaf, Leaf, LeafEntry, LeafFormat, ValueRef};
use crate::map::queue::ExpireQueue;
use crate::store::Store;

/// TTL sentinel: the entry is queued but its node carries timestamp `0`,
/// so it never time-expires and is purged only by size caps
pub const EXPIRE_NEVER: i64 = -1;

/// Observer of map mutations
///
/// `triggered` is true when the change came from eviction or the value
/// loader rather than an explicit caller mutation, so overflow collections
/// downstream can distinguish the two.
pub trait ModificationListener<K, V>: Send + Sync {
    /// Called after an entry is created (`old_value` absent), updated
    /// (both present) or removed (`new_value` absent)
    fn modify(&self, key: &K, old_value: Option<&V>, new_value: Option<&V>, triggered: bool);
}

/// Loader consulted by `get` on a miss; a returned value is inserted
pub type ValueLoader<K, V> = dyn Fn(&K) -> Option<V> + Send + Sync;

/// How [`ShardMap::clear_with`] reports removed entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// Wipe without notifications
    Silent,
    /// Notify listeners with `triggered = false`
    Notify,
    /// Notify listeners as if every entry expired (`triggered = true`)
    AsExpired,
}

/// Per-segment state guarded by the segment's RW-lock
pub(crate) struct Segment {
    pub(crate) index_tree: IndexTree,
    pub(crate) create_queue: Option<ExpireQueue>,
    pub(crate) update_queue: Option<ExpireQueue>,
    pub(crate) get_queue: Option<ExpireQueue>,
    /// 0 when counters are disabled
    pub(crate) counter_recid: u64,
}

impl Segment {
    pub(crate) fn queue(&self, tag: QueueTag) -> Option<&ExpireQueue> {
        match tag {
            QueueTag::Create => self.create_queue.as_ref(),
            QueueTag::Update => self.update_queue.as_ref(),
            QueueTag::Get => self.get_queue.as_ref(),
        }
    }

    pub(crate) fn queue_mut(&mut self, tag: QueueTag) -> Option<&mut ExpireQueue> {
        match tag {
            QueueTag::Create => self.create_queue.as_mut(),
            QueueTag::Update => self.update_queue.as_mut(),
            QueueTag::Get => self.get_queue.as_mut(),
        }
    }
}

/// Concurrent, segmented, persistable hash map
///
/// Built through [`ShardMap::builder`]. See the crate docs for an
/// overview; see [`Builder`] for every knob.
pub struct ShardMap<K, V> {
    // Hash geometry
    pub(crate) conc_shift: u32,
    pub(crate) level_bits: u32,
    pub(crate) index_mask: u64,
    pub(crate) seg_mask: u32,
    pub(crate) hash_seed: u32,

    // Value handling
    pub(crate) format: LeafFormat,
    pub(crate) has_values: bool,

    // Expiration configuration (milliseconds; see [`EXPIRE_NEVER`])
    pub(crate) expire_create_ttl: i64,
    pub(crate) expire_update_ttl: i64,
    pub(crate) expire_get_ttl: i64,
    pub(crate) expire_max_size: u64,
    pub(crate) expire_store_size: u64,
    pub(crate) expire_compact_threshold: Option<f64>,
    pub(crate) has_queues: bool,
    pub(crate) executor_attached: bool,

    // Collaborators
    pub(crate) key_codec: Arc<dyn Codec<K>>,
    pub(crate) value_codec: Arc<dyn Codec<V>>,
    pub(crate) key_hash: Arc<dyn HashOps<K>>,
    pub(crate) value_hash: Arc<dyn HashOps<V>>,
    pub(crate) stores: Vec<Arc<dyn Store>>,
    pub(crate) segments: Vec<RwLock<Segment>>,
    pub(crate) listeners: Vec<Arc<dyn ModificationListener<K, V>>>,
    pub(crate) value_loader: Option<Arc<ValueLoader<K, V>>>,

    // Lifecycle
    pub(crate) hash_checked: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) executor: Mutex<Option<EvictionExecutor>>,
}

impl<K, V> std::fmt::Debug for ShardMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMap")
            .field("conc_shift", &self.conc_shift)
            .field("level_bits", &self.level_bits)
            .field("has_values", &self.has_values)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<K, V> ShardMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Start building a map
    pub fn builder() -> Builder<K, V> {
        Builder::new()
    }

    /// Number of segments (`1 << conc_shift`)
    pub fn segment_count(&self) -> usize {
        1usize << self.conc_shift
    }

    /// True once [`ShardMap::close`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Hash geometry
    // =========================================================================

    pub(crate) fn hash(&self, key: &K) -> u32 {
        // Routing always uses seed 0; `hash_seed` participates only in
        // structural content hashing.
        self.key_hash.hash_code(key, 0)
    }

    pub(crate) fn hash_to_segment(&self, hash: u32) -> usize {
        (hash.checked_shr(self.level_bits).unwrap_or(0) & self.seg_mask) as usize
    }

    pub(crate) fn hash_to_index(&self, hash: u32) -> u64 {
        u64::from(hash) & self.index_mask
    }

    fn route(&self, key: &K) -> (usize, u64) {
        let hash = self.hash(key);
        (self.hash_to_segment(hash), self.hash_to_index(hash))
    }

    // =========================================================================
    // Leaf and value plumbing
    // =========================================================================

    pub(crate) fn store(&self, segment: usize) -> &dyn Store {
        &*self.stores[segment]
    }

    pub(crate) fn load_leaf(&self, store: &dyn Store, leaf_recid: u64) -> Result<Leaf<K, V>> {
        match store.get(leaf_recid)? {
            Some(data) => decode_leaf(
                self.format,
                self.key_codec.as_ref(),
                self.value_codec.as_ref(),
                &data,
            ),
            None => Err(Error::corruption(format!(
                "leaf record {} is not initialized",
                leaf_recid
            ))),
        }
    }

    fn encode_leaf_buf(&self, leaf: &Leaf<K, V>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        encode_leaf(
            self.format,
            self.key_codec.as_ref(),
            self.value_codec.as_ref(),
            leaf,
            &mut buf,
        )?;
        Ok(buf)
    }

    fn save_leaf(&self, store: &dyn Store, leaf_recid: u64, leaf: &Leaf<K, V>) -> Result<()> {
        store.update(leaf_recid, &self.encode_leaf_buf(leaf)?)
    }

    pub(crate) fn unwrap_value(&self, store: &dyn Store, value: &ValueRef<V>) -> Result<V> {
        match value {
            ValueRef::Inline(v) => Ok(v.clone()),
            ValueRef::External(recid) => match store.get(*recid)? {
                Some(data) => self.value_codec.decode(&mut &data[..]),
                None => Err(Error::corruption(format!(
                    "external value record {} is not initialized",
                    recid
                ))),
            },
        }
    }

    fn find_entry(&self, leaf: &Leaf<K, V>, key: &K) -> Option<usize> {
        leaf.iter()
            .position(|entry| self.key_hash.equals(&entry.key, key))
    }

    fn scan_current(
        &self,
        segment: usize,
        seg: &Segment,
        index: u64,
        key: &K,
    ) -> Result<Option<V>> {
        let store = self.store(segment);
        let leaf_recid = seg.index_tree.get(index);
        if leaf_recid == 0 {
            return Ok(None);
        }
        let leaf = self.load_leaf(store, leaf_recid)?;
        match self.find_entry(&leaf, key) {
            Some(pos) => Ok(Some(self.unwrap_value(store, &leaf[pos].value)?)),
            None => Ok(None),
        }
    }

    fn scan_contains(&self, segment: usize, seg: &Segment, index: u64, key: &K) -> Result<bool> {
        let store = self.store(segment);
        let leaf_recid = seg.index_tree.get(index);
        if leaf_recid == 0 {
            return Ok(false);
        }
        let leaf = self.load_leaf(store, leaf_recid)?;
        Ok(self.find_entry(&leaf, key).is_some())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    pub(crate) fn counter_get(&self, seg: &Segment, store: &dyn Store) -> Result<i64> {
        if seg.counter_recid == 0 {
            return Ok(0);
        }
        match store.get(seg.counter_recid)? {
            Some(data) if data.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data);
                Ok(i64::from_le_bytes(bytes))
            }
            _ => Err(Error::corruption("counter record is missing or malformed")),
        }
    }

    fn counter_add(&self, seg: &Segment, store: &dyn Store, delta: i64) -> Result<()> {
        if seg.counter_recid == 0 {
            return Ok(());
        }
        let current = self.counter_get(seg, store)?;
        store.update(seg.counter_recid, &(current + delta).to_le_bytes())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MapClosed);
        }
        Ok(())
    }

    /// Close the map: takes every segment lock in order, marks the map
    /// closed and stops the background eviction executor.
    pub fn close(&self) {
        {
            let _guards: Vec<_> = self.segments.iter().map(|s| s.write()).collect();
            self.closed.store(true, Ordering::Release);
        }
        if let Some(mut executor) = self.executor.lock().take() {
            executor.stop();
        }
    }

    // One-shot, best effort: clone the key through the codec and confirm
    // the hash survives the round trip. Racing first-puts may both check,
    // which is harmless.
    fn check_hash_stability(&self, key: &K) -> Result<()> {
        if self.hash_checked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut buf = Vec::new();
        self.key_codec.encode(&mut buf, key)?;
        let clone = self.key_codec.decode(&mut &buf[..])?;
        if self.key_hash.hash_code(key, 0) != self.key_hash.hash_code(&clone, 0) {
            return Err(Error::invalid_argument(
                "key hash is not stable across a serialization round trip; \
                 the key codec and key hasher are inconsistent",
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn notify(&self, key: &K, old: Option<&V>, new: Option<&V>, triggered: bool) {
        for listener in &self.listeners {
            listener.modify(key, old, new, triggered);
        }
    }

    // =========================================================================
    // Expiration plumbing shared by put and get
    // =========================================================================

    /// Insert, bump or transfer the queue node backing `entry` so it ends
    /// up in the `target` queue with a fresh deadline. Returns true when
    /// the leaf must be rewritten (its `expire_id` changed).
    fn touch_queue(
        &self,
        seg: &mut Segment,
        store: &dyn Store,
        entry: &mut LeafEntry<K, V>,
        target: QueueTag,
        ttl: i64,
        leaf_recid: u64,
    ) -> Result<bool> {
        let timestamp = expire_timestamp(ttl);
        if entry.expire_id == 0 {
            let queue = seg
                .queue_mut(target)
                .ok_or_else(|| Error::internal("touch_queue called without target queue"))?;
            let node_recid = queue.push(store, timestamp, leaf_recid)?;
            entry.expire_id = make_expire_id(node_recid, target);
            return Ok(true);
        }
        let owner = expire_tag(entry.expire_id)?;
        let node_recid = expire_node_recid(entry.expire_id);
        if owner == target {
            let queue = seg
                .queue_mut(target)
                .ok_or_else(|| Error::corruption("expire id references an absent queue"))?;
            queue.bump(store, node_recid, timestamp)?;
            return Ok(false);
        }
        // Move the node between queues in place: unlink it from its owner
        // without deleting the record, then relink the same recid into the
        // target queue. Only the tag bits of the leaf's expire id change.
        let owner_queue = seg
            .queue_mut(owner)
            .ok_or_else(|| Error::corruption("expire id references an absent queue"))?;
        owner_queue.remove(store, node_recid, false)?;
        let target_queue = seg
            .queue_mut(target)
            .ok_or_else(|| Error::internal("touch_queue called without target queue"))?;
        target_queue.push_at(store, timestamp, leaf_recid, node_recid)?;
        entry.expire_id = make_expire_id(node_recid, target);
        Ok(true)
    }

    /// True when eviction runs inline inside user operations
    pub(crate) fn foreground_eviction(&self) -> bool {
        self.has_queues && !self.executor_attached
    }

    fn evict_foreground(&self, segment: usize, seg: &mut Segment) -> Result<()> {
        if self.foreground_eviction() {
            self.evict_segment_locked(segment, seg)?;
        }
        Ok(())
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Insert or update, returning the previous value
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_inner(key, value, true, false)
    }

    /// Insert or update without materializing the previous value
    pub fn put_only(&self, key: K, value: V) -> Result<()> {
        self.put_inner(key, value, false, false)?;
        Ok(())
    }

    fn put_inner(&self, key: K, value: V, need_old: bool, triggered: bool) -> Result<Option<V>> {
        self.check_open()?;
        self.check_hash_stability(&key)?;
        let (segment, index) = self.route(&key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        self.put_locked(segment, &mut seg, index, key, value, need_old, triggered)
    }

    /// The write-locked insert/update path. Shared by `put`, the loader
    /// path of `get` and the conditional writes.
    fn put_locked(
        &self,
        segment: usize,
        seg: &mut Segment,
        index: u64,
        key: K,
        value: V,
        need_old: bool,
        triggered: bool,
    ) -> Result<Option<V>> {
        let store = self.store(segment);
        let leaf_recid = seg.index_tree.get(index);

        if leaf_recid == 0 {
            return self.insert_new_leaf(segment, seg, index, key, value, triggered);
        }

        let mut leaf = self.load_leaf(store, leaf_recid)?;
        #[cfg(feature = "paranoid")]
        for entry in &leaf {
            let hash = self.hash(&entry.key);
            assert_eq!(self.hash_to_segment(hash), segment, "leaf in wrong segment");
            assert_eq!(self.hash_to_index(hash), index, "leaf at wrong index");
        }

        if let Some(pos) = self.find_entry(&leaf, &key) {
            // Key match: update in place
            let old = if need_old || self.has_listeners() {
                Some(self.unwrap_value(store, &leaf[pos].value)?)
            } else {
                None
            };

            let mut leaf_dirty = false;
            if seg.update_queue.is_some() {
                leaf_dirty = self.touch_queue(
                    seg,
                    store,
                    &mut leaf[pos],
                    QueueTag::Update,
                    self.expire_update_ttl,
                    leaf_recid,
                )?;
            }

            let external_recid = leaf[pos].value.external_recid();
            let mut moved_value = None;
            match external_recid {
                None => {
                    leaf[pos].value = ValueRef::Inline(value);
                    leaf_dirty = true;
                }
                Some(value_recid) => {
                    let mut buf = Vec::new();
                    self.value_codec.encode(&mut buf, &value)?;
                    store.update(value_recid, &buf)?;
                    moved_value = Some(value);
                }
            }
            if leaf_dirty {
                self.save_leaf(store, leaf_recid, &leaf)?;
            }

            let entry = &leaf[pos];
            let new_ref = entry.value.as_inline().or(moved_value.as_ref());
            self.notify(&entry.key, old.as_ref(), new_ref, triggered);
            return Ok(old);
        }

        // No match: append a triple to the collision chain
        let (wrapped, moved_value) = self.wrap_value(store, value)?;
        let mut expire_id = 0;
        if let Some(queue) = seg.create_queue.as_mut() {
            let timestamp = expire_timestamp(self.expire_create_ttl);
            let node_recid = queue.push(store, timestamp, leaf_recid)?;
            expire_id = make_expire_id(node_recid, QueueTag::Create);
        }
        leaf.push(LeafEntry {
            key,
            value: wrapped,
            expire_id,
        });
        self.save_leaf(store, leaf_recid, &leaf)?;
        self.counter_add(seg, store, 1)?;

        let entry = leaf.last().ok_or_else(|| Error::internal("empty leaf"))?;
        let new_ref = entry.value.as_inline().or(moved_value.as_ref());
        self.notify(&entry.key, None, new_ref, triggered);
        Ok(None)
    }

    fn wrap_value(&self, store: &dyn Store, value: V) -> Result<(ValueRef<V>, Option<V>)> {
        match self.format {
            LeafFormat::InlineValues | LeafFormat::KeySet => Ok((ValueRef::Inline(value), None)),
            LeafFormat::ExternalValues => {
                let mut buf = Vec::new();
                self.value_codec.encode(&mut buf, &value)?;
                let recid = store.put(&buf)?;
                Ok((ValueRef::External(recid), Some(value)))
            }
        }
    }

    fn insert_new_leaf(
        &self,
        segment: usize,
        seg: &mut Segment,
        index: u64,
        key: K,
        value: V,
        triggered: bool,
    ) -> Result<Option<V>> {
        let store = self.store(segment);
        let (wrapped, moved_value) = self.wrap_value(store, value)?;

        let (leaf_recid, expire_id) = if seg.create_queue.is_some() {
            // The leaf must reference the queue node and the queue node the
            // leaf: preallocate the leaf recid, push the node against it,
            // then write the leaf carrying the node's expire id.
            let leaf_recid = store.preallocate()?;
            let timestamp = expire_timestamp(self.expire_create_ttl);
            let queue = seg
                .queue_mut(QueueTag::Create)
                .ok_or_else(|| Error::internal("create queue vanished"))?;
            let node_recid = queue.push(store, timestamp, leaf_recid)?;
            (leaf_recid, make_expire_id(node_recid, QueueTag::Create))
        } else {
            (0, 0)
        };

        let leaf: Leaf<K, V> = std::iter::once(LeafEntry {
            key,
            value: wrapped,
            expire_id,
        })
        .collect();
        let leaf_recid = if leaf_recid != 0 {
            store.update(leaf_recid, &self.encode_leaf_buf(&leaf)?)?;
            leaf_recid
        } else {
            store.put(&self.encode_leaf_buf(&leaf)?)?
        };
        seg.index_tree.put(index, leaf_recid)?;
        self.counter_add(seg, store, 1)?;

        let entry = &leaf[0];
        let new_ref = entry.value.as_inline().or(moved_value.as_ref());
        self.notify(&entry.key, None, new_ref, triggered);
        Ok(None)
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look up a key. May consult the value loader on a miss and may
    /// perform foreground eviction or GET-queue maintenance, in which case
    /// it runs under the segment's write lock.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let has_get_queue = self.expire_get_ttl != 0;
        let write_path =
            has_get_queue || self.value_loader.is_some() || self.foreground_eviction();

        if !write_path {
            let seg = self.segments[segment].read();
            return self.scan_current(segment, &seg, index, key);
        }

        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;

        let store = self.store(segment);
        let leaf_recid = seg.index_tree.get(index);
        if leaf_recid != 0 {
            let mut leaf = self.load_leaf(store, leaf_recid)?;
            if let Some(pos) = self.find_entry(&leaf, key) {
                if has_get_queue && seg.get_queue.is_some() {
                    let dirty = self.touch_queue(
                        &mut seg,
                        store,
                        &mut leaf[pos],
                        QueueTag::Get,
                        self.expire_get_ttl,
                        leaf_recid,
                    )?;
                    if dirty {
                        self.save_leaf(store, leaf_recid, &leaf)?;
                    }
                }
                return Ok(Some(self.unwrap_value(store, &leaf[pos].value)?));
            }
        }

        // Miss: consult the loader, inserting whatever it produces
        if let Some(loader) = self.value_loader.clone() {
            if let Some(value) = loader(key) {
                self.put_locked(
                    segment,
                    &mut seg,
                    index,
                    key.clone(),
                    value.clone(),
                    false,
                    true,
                )?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Presence check. Does not consult the value loader, does not touch
    /// expiration queues and does not evict.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let seg = self.segments[segment].read();
        self.scan_contains(segment, &seg, index, key)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove a key, returning its value
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        let (_, old) = self.remove_locked(segment, &mut seg, index, key, false, true)?;
        Ok(old)
    }

    /// Remove a key, reporting only whether it was present
    pub fn remove_present(&self, key: &K) -> Result<bool> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        let (found, _) = self.remove_locked(segment, &mut seg, index, key, false, false)?;
        Ok(found)
    }

    /// Remove a key only if its current value equals `expected`
    pub fn remove_entry(&self, key: &K, expected: &V) -> Result<bool> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        match self.scan_current(segment, &seg, index, key)? {
            Some(current) if self.value_hash.equals(&current, expected) => {
                let (found, _) = self.remove_locked(segment, &mut seg, index, key, false, false)?;
                Ok(found)
            }
            _ => Ok(false),
        }
    }

    /// The write-locked removal path, shared by the public removals and by
    /// eviction (`evicted = true`, where the queue node is already gone).
    pub(crate) fn remove_locked(
        &self,
        segment: usize,
        seg: &mut Segment,
        index: u64,
        key: &K,
        evicted: bool,
        need_old: bool,
    ) -> Result<(bool, Option<V>)> {
        let store = self.store(segment);
        let leaf_recid = seg.index_tree.get(index);
        if leaf_recid == 0 {
            return Ok((false, None));
        }
        let mut leaf = self.load_leaf(store, leaf_recid)?;
        let Some(pos) = self.find_entry(&leaf, key) else {
            return Ok((false, None));
        };

        let old = if need_old || self.has_listeners() {
            Some(self.unwrap_value(store, &leaf[pos].value)?)
        } else {
            None
        };

        // Drop the queue node unless eviction already consumed it
        let expire_id = leaf[pos].expire_id;
        if !evicted && expire_id != 0 {
            let owner = expire_tag(expire_id)?;
            let node_recid = expire_node_recid(expire_id);
            let queue = seg
                .queue_mut(owner)
                .ok_or_else(|| Error::corruption("expire id references an absent queue"))?;
            queue.remove(store, node_recid, true)?;
        }

        let entry = leaf.remove(pos);
        if leaf.is_empty() {
            seg.index_tree.remove(index);
            store.delete(leaf_recid)?;
        } else {
            self.save_leaf(store, leaf_recid, &leaf)?;
        }
        if let Some(value_recid) = entry.value.external_recid() {
            store.delete(value_recid)?;
        }
        self.counter_add(seg, store, -1)?;
        self.notify(&entry.key, old.as_ref(), None, evicted);
        Ok((true, old))
    }

    // =========================================================================
    // Conditional writes
    // =========================================================================

    /// Insert `value` unless the key is present; returns the current value
    /// when it is
    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.check_open()?;
        self.check_hash_stability(&key)?;
        let (segment, index) = self.route(&key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        if let Some(current) = self.scan_current(segment, &seg, index, &key)? {
            return Ok(Some(current));
        }
        self.put_locked(segment, &mut seg, index, key, value, false, false)?;
        Ok(None)
    }

    /// Like [`ShardMap::put_if_absent`] but only reports whether the
    /// insert happened, skipping the needless value unwrap
    pub fn put_if_absent_bool(&self, key: K, value: V) -> Result<bool> {
        self.check_open()?;
        self.check_hash_stability(&key)?;
        let (segment, index) = self.route(&key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        if self.scan_contains(segment, &seg, index, &key)? {
            return Ok(false);
        }
        self.put_locked(segment, &mut seg, index, key, value, false, false)?;
        Ok(true)
    }

    /// Replace the value only if the key is present, returning the
    /// previous value
    pub fn replace(&self, key: &K, value: V) -> Result<Option<V>> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        if !self.scan_contains(segment, &seg, index, key)? {
            return Ok(None);
        }
        self.put_locked(segment, &mut seg, index, key.clone(), value, true, false)
    }

    /// Replace the value only if the current value equals `expected`
    pub fn replace_if(&self, key: &K, expected: &V, value: V) -> Result<bool> {
        self.check_open()?;
        let (segment, index) = self.route(key);
        let mut seg = self.segments[segment].write();
        self.evict_foreground(segment, &mut seg)?;
        match self.scan_current(segment, &seg, index, key)? {
            Some(current) if self.value_hash.equals(&current, expected) => {
                self.put_locked(segment, &mut seg, index, key.clone(), value, false, false)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Key-set insert: adds `key` with the present-marker value. Errors
    /// with an illegal state on a map that carries real values.
    pub fn add_key(&self, key: K) -> Result<bool>
    where
        V: Default,
    {
        if self.has_values {
            return Err(Error::illegal_state(
                "add_key is only available on a key-set map",
            ));
        }
        self.put_if_absent_bool(key, V::default())
    }

    // =========================================================================
    // Clear
    // =========================================================================

    /// Wipe the map without notifying listeners
    pub fn clear(&self) -> Result<()> {
        self.clear_with(ClearMode::Silent)
    }

    /// Wipe the map, notifying listeners with `triggered = false`
    pub fn clear_notify(&self) -> Result<()> {
        self.clear_with(ClearMode::Notify)
    }

    /// Wipe the map as if every entry expired (`triggered = true`)
    pub fn clear_as_expired(&self) -> Result<()> {
        self.clear_with(ClearMode::AsExpired)
    }

    /// Wipe the map. Segments are cleared one at a time; concurrent
    /// mutators may slip entries into already-cleared segments, so the
    /// map is only guaranteed empty if the caller quiesces writers.
    pub fn clear_with(&self, mode: ClearMode) -> Result<()> {
        self.check_open()?;
        for segment in 0..self.segments.len() {
            let mut seg = self.segments[segment].write();
            let store = self.store(segment);

            let mut leaf_recids = Vec::new();
            seg.index_tree
                .for_each(&mut |_, leaf_recid| leaf_recids.push(leaf_recid));

            let notifying = mode != ClearMode::Silent && self.has_listeners();
            for leaf_recid in leaf_recids {
                let leaf = self.load_leaf(store, leaf_recid)?;
                store.delete(leaf_recid)?;
                for entry in leaf {
                    let old = if notifying {
                        Some(self.unwrap_value(store, &entry.value)?)
                    } else {
                        None
                    };
                    if let Some(value_recid) = entry.value.external_recid() {
                        store.delete(value_recid)?;
                    }
                    if notifying {
                        self.notify(
                            &entry.key,
                            old.as_ref(),
                            None,
                            mode == ClearMode::AsExpired,
                        );
                    }
                }
            }

            for tag in [QueueTag::Get, QueueTag::Update, QueueTag::Create] {
                if let Some(queue) = seg.queue_mut(tag) {
                    queue.clear(store)?;
                }
            }
            seg.index_tree.clear();
            if seg.counter_recid != 0 {
                store.update(seg.counter_recid, &0i64.to_le_bytes())?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Size and traversal
    // =========================================================================

    /// Number of entries, saturating at `usize::MAX`. Reads per-segment
    /// counters when present; otherwise walks every leaf.
    pub fn len(&self) -> Result<usize> {
        self.check_open()?;
        let mut total: u128 = 0;
        for segment in 0..self.segments.len() {
            let seg = self.segments[segment].read();
            let store = self.store(segment);
            if seg.counter_recid != 0 {
                total += self.counter_get(&seg, store)?.max(0) as u128;
            } else {
                let mut leaf_recids = Vec::new();
                seg.index_tree
                    .for_each(&mut |_, leaf_recid| leaf_recids.push(leaf_recid));
                for leaf_recid in leaf_recids {
                    total += self.load_leaf(store, leaf_recid)?.len() as u128;
                }
            }
        }
        Ok(usize::try_from(total).unwrap_or(usize::MAX))
    }

    /// True if no segment holds any entry
    pub fn is_empty(&self) -> Result<bool> {
        self.check_open()?;
        for segment in &self.segments {
            if !segment.read().index_tree.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Iterate over `(key, value)` pairs. Segments are visited in order;
    /// each leaf is snapshotted under the segment's read lock, re-acquired
    /// per leaf. Cross-leaf atomicity is not provided.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self)
    }

    /// Iterate over keys
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self)
    }

    /// Iterate over values
    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self)
    }

    /// Visit every entry with a closure
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) -> Result<()> {
        for item in self.iter() {
            let (key, value) = item?;
            f(&key, &value);
        }
        Ok(())
    }

    /// True if some entry holds `value`. Linear in the map size.
    pub fn contains_value(&self, value: &V) -> Result<bool> {
        for item in self.iter() {
            let (_, v) = item?;
            if self.value_hash.equals(&v, value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if `key` currently maps to `value`, compared through the value
    /// hasher against a live `get`
    pub fn contains_entry(&self, key: &K, value: &V) -> Result<bool> {
        match self.get(key)? {
            Some(current) => Ok(self.value_hash.equals(&current, value)),
            None => Ok(false),
        }
    }

    /// Structural content hash: the sum over entries of
    /// `key_hash(k, seed) XOR value_hash(v, seed)` with the configured
    /// `hash_seed`
    pub fn content_hash(&self) -> Result<u32> {
        let mut acc: u32 = 0;
        for item in self.iter() {
            let (key, value) = item?;
            acc = acc.wrapping_add(
                self.key_hash.hash_code(&key, self.hash_seed)
                    ^ self.value_hash.hash_code(&value, self.hash_seed),
            );
        }
        Ok(acc)
    }

    /// Structural equality: same size and the same value under every key,
    /// compared through this map's value hasher
    pub fn content_eq(&self, other: &ShardMap<K, V>) -> Result<bool> {
        if self.len()? != other.len()? {
            return Ok(false);
        }
        for item in self.iter() {
            let (key, value) = item?;
            match other.get(&key)? {
                Some(theirs) if self.value_hash.equals(&value, &theirs) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<K, V> Drop for ShardMap<K, V> {
    fn drop(&mut self) {
        if let Some(mut executor) = self.executor.lock().take() {
            executor.stop();
        }
    }
}
