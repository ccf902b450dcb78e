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

//! Eviction: expire-id tagging, segment sweeps and the background executor
//!
//! Every queued leaf entry carries an `expire_id` whose low 2 bits name the
//! owning queue (1 = CREATE, 2 = UPDATE, 3 = GET) and whose upper 62 bits
//! are the queue node's recid. Sweeping a segment walks its queues in the
//! order GET, UPDATE, CREATE and consumes the prefix of nodes that are past
//! their deadline or needed to satisfy the entry-count / store-size caps.
//!
//! With an executor attached, sweeps run on a background thread at a fixed
//! per-segment rate with an initial random jitter so segments do not burst
//! together. Without one, sweeps run inline at the start of write-locked
//! user operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::{now_millis, Error, Result};
use crate::map::{Segment, ShardMap, EXPIRE_NEVER};

/// Which expiration queue owns a node, stored in an expire id's low 2 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueTag {
    Create = 1,
    Update = 2,
    Get = 3,
}

/// Build an expire id from a node recid and the owning queue's tag
pub(crate) fn make_expire_id(node_recid: u64, tag: QueueTag) -> u64 {
    debug_assert!(node_recid != 0);
    (node_recid << 2) | tag as u64
}

/// Extract the node recid from a non-zero expire id
pub(crate) fn expire_node_recid(expire_id: u64) -> u64 {
    expire_id >> 2
}

/// Extract the owning queue's tag from a non-zero expire id
pub(crate) fn expire_tag(expire_id: u64) -> Result<QueueTag> {
    match expire_id & 0b11 {
        1 => Ok(QueueTag::Create),
        2 => Ok(QueueTag::Update),
        3 => Ok(QueueTag::Get),
        tag => Err(Error::corruption(format!(
            "expire id {:#x} has invalid queue tag {}",
            expire_id, tag
        ))),
    }
}

/// Deadline for a queue node given a TTL in milliseconds. [`EXPIRE_NEVER`]
/// maps to timestamp `0`, which never time-expires.
pub(crate) fn expire_timestamp(ttl: i64) -> i64 {
    if ttl == EXPIRE_NEVER {
        0
    } else {
        now_millis() + ttl
    }
}

impl<K, V> ShardMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Sweep one segment under its write lock
    pub fn expire_evict_segment(&self, segment: usize) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MapClosed);
        }
        if segment >= self.segments.len() {
            return Err(Error::invalid_argument(format!(
                "segment {} out of range",
                segment
            )));
        }
        let mut seg = self.segments[segment].write();
        self.evict_segment_locked(segment, &mut seg)
    }

    /// Sweep every segment, one write lock at a time
    pub fn expire_evict(&self) -> Result<()> {
        for segment in 0..self.segments.len() {
            self.expire_evict_segment(segment)?;
        }
        Ok(())
    }

    /// The sweep itself; the caller holds the segment write lock.
    pub(crate) fn evict_segment_locked(&self, segment: usize, seg: &mut Segment) -> Result<()> {
        let store = self.store(segment);
        let now = now_millis();

        // Entry-count cap: each segment sheds its share of the overflow.
        // The counter approximates the map size as seg_size * segment_count,
        // so the cap is only approximate across segments.
        let mut number_to_take: i64 = 0;
        if self.expire_max_size != 0 {
            let seg_count = self.segments.len() as i64;
            let seg_size = self.counter_get(seg, store)?;
            number_to_take =
                ((seg_size * seg_count - self.expire_max_size as i64) / seg_count).max(0);
        }

        for tag in [QueueTag::Get, QueueTag::Update, QueueTag::Create] {
            let taken = {
                let Some(queue) = seg.queue_mut(tag) else {
                    continue;
                };
                if queue.is_empty() {
                    continue;
                }
                queue.take_until(store, |_, node| {
                    if number_to_take > 0 {
                        number_to_take -= 1;
                        return true;
                    }
                    if node.timestamp != 0 && node.timestamp < now {
                        return true;
                    }
                    if self.expire_store_size != 0 {
                        if let (Some(tail), Some(free)) = (store.file_tail(), store.free_size()) {
                            return tail.saturating_sub(free) > self.expire_store_size;
                        }
                    }
                    false
                })?
            };
            for (node_recid, node) in taken {
                self.evict_entry(segment, seg, node.value, node_recid)?;
            }
        }

        if let Some(threshold) = self.expire_compact_threshold {
            if let (Some(free), Some(total)) = (store.free_size(), store.total_size()) {
                if total > 0 && free as f64 / total as f64 > threshold {
                    store.compact()?;
                }
            }
        }
        Ok(())
    }

    /// Remove the entry whose queue node was just consumed. The leaf triple
    /// is located by its node recid; the queue no longer holds the node, so
    /// the removal runs with `evicted = true`.
    fn evict_entry(
        &self,
        segment: usize,
        seg: &mut Segment,
        leaf_recid: u64,
        node_recid: u64,
    ) -> Result<()> {
        let store = self.store(segment);
        let leaf = self.load_leaf(store, leaf_recid)?;
        let entry = leaf
            .iter()
            .find(|entry| entry.expire_id != 0 && expire_node_recid(entry.expire_id) == node_recid)
            .ok_or_else(|| {
                Error::corruption(format!(
                    "queue node {} references leaf {} but no triple carries it",
                    node_recid, leaf_recid
                ))
            })?;
        let key = entry.key.clone();

        let hash = self.hash(&key);
        let index = self.hash_to_index(hash);
        #[cfg(feature = "paranoid")]
        assert_eq!(
            self.hash_to_segment(hash),
            segment,
            "evicting entry routed to another segment"
        );

        self.remove_locked(segment, seg, index, &key, true, false)?;
        Ok(())
    }

    pub(crate) fn start_executor(self: &Arc<Self>, period: Duration) {
        let executor = EvictionExecutor::start(Arc::downgrade(self), period, self.segments.len());
        *self.executor.lock() = Some(executor);
    }
}

/// Background eviction thread; stops on drop
pub(crate) struct EvictionExecutor {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EvictionExecutor {
    fn start<K, V>(map: Weak<ShardMap<K, V>>, period: Duration, segment_count: usize) -> Self
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_flag);

        let handle = std::thread::spawn(move || {
            let period_ms = period.as_millis().max(1) as u64;
            // Initial jitter in [0, period) per segment so segments do not
            // sweep in a synchronized burst
            let mut next_due: Vec<Instant> = {
                let mut rng = rand::thread_rng();
                (0..segment_count)
                    .map(|_| Instant::now() + Duration::from_millis(rng.gen_range(0..period_ms)))
                    .collect()
            };
            let tick = Duration::from_millis((period_ms / 4).clamp(1, 50));

            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(tick);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let Some(map) = map.upgrade() else {
                    break;
                };
                if map.is_closed() {
                    break;
                }
                let now = Instant::now();
                for segment in 0..segment_count {
                    if now >= next_due[segment] {
                        // Sweep failures must never kill the executor
                        if let Err(err) = map.expire_evict_segment(segment) {
                            if !err.is_closed() {
                                eprintln!(
                                    "Warning: background eviction failed for segment {}: {}",
                                    segment, err
                                );
                            }
                        }
                        next_due[segment] = Instant::now() + period;
                    }
                }
            }
        });

        EvictionExecutor {
            stop_flag,
            thread: Some(handle),
        }
    }

    /// Stop the executor thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // The executor's own thread can end up dropping the map's last
            // Arc; joining ourselves would deadlock, so just detach then.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EvictionExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
