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

//! Structural verification
//!
//! Walks every segment under its read lock and cross-checks the index
//! tree, the leaf records, the expiration queues and the counters against
//! each other. Any mismatch is reported as data corruption.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::{Error, Result};
use crate::map::expire::{expire_node_recid, expire_tag, QueueTag};
use crate::map::ShardMap;

impl<K, V> ShardMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Verify every invariant that ties the index trees, leaves, queues
    /// and counters together:
    ///
    /// - the index tree is structurally sound and no leaf recid appears
    ///   under two indices
    /// - every triple hashes back to its own `(segment, index)` bucket
    /// - every non-zero expire id names an existing queue and a unique
    ///   node recid
    /// - every queue is link-consistent, and its nodes pair one-to-one
    ///   with the leaf triples that reference them
    /// - counters match the number of triples in their segment
    pub fn verify(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MapClosed);
        }
        for segment in 0..self.segments.len() {
            let seg = self.segments[segment].read();
            let store = self.store(segment);

            seg.index_tree.verify()?;

            let mut pairs = Vec::new();
            seg.index_tree
                .for_each(&mut |index, leaf_recid| pairs.push((index, leaf_recid)));
            if pairs.len() != seg.index_tree.len() {
                return Err(Error::corruption(format!(
                    "index tree reports {} entries but yielded {}",
                    seg.index_tree.len(),
                    pairs.len()
                )));
            }

            let mut leaf_recids: FxHashSet<u64> = FxHashSet::default();
            // node recid -> owning leaf recid, drained by the queue walks
            let mut expected_nodes: FxHashMap<u64, u64> = FxHashMap::default();
            let mut triples: i64 = 0;

            for (index, leaf_recid) in pairs {
                if !leaf_recids.insert(leaf_recid) {
                    return Err(Error::corruption(format!(
                        "leaf recid {} referenced by more than one index",
                        leaf_recid
                    )));
                }
                let leaf = self.load_leaf(store, leaf_recid)?;
                for entry in &leaf {
                    triples += 1;
                    let hash = self.hash(&entry.key);
                    if self.hash_to_segment(hash) != segment {
                        return Err(Error::corruption(format!(
                            "entry in segment {} hashes to segment {}",
                            segment,
                            self.hash_to_segment(hash)
                        )));
                    }
                    if self.hash_to_index(hash) != index {
                        return Err(Error::corruption(format!(
                            "entry at index {} hashes to index {}",
                            index,
                            self.hash_to_index(hash)
                        )));
                    }
                    if entry.expire_id == 0 {
                        continue;
                    }
                    if !self.has_queues {
                        return Err(Error::corruption(
                            "entry carries an expire id but expiration is disabled",
                        ));
                    }
                    let tag = expire_tag(entry.expire_id)?;
                    if seg.queue(tag).is_none() {
                        return Err(Error::corruption(format!(
                            "expire id references queue {:?} which is not configured",
                            tag
                        )));
                    }
                    let node_recid = expire_node_recid(entry.expire_id);
                    if expected_nodes.insert(node_recid, leaf_recid).is_some() {
                        return Err(Error::corruption(format!(
                            "queue node {} referenced by more than one triple",
                            node_recid
                        )));
                    }
                }
            }

            let queued: u64 = [QueueTag::Get, QueueTag::Update, QueueTag::Create]
                .iter()
                .filter_map(|tag| seg.queue(*tag))
                .map(|queue| queue.len())
                .sum();
            if queued != expected_nodes.len() as u64 {
                return Err(Error::corruption(format!(
                    "queues hold {} nodes but leaves reference {}",
                    queued,
                    expected_nodes.len()
                )));
            }

            for tag in [QueueTag::Get, QueueTag::Update, QueueTag::Create] {
                let Some(queue) = seg.queue(tag) else {
                    continue;
                };
                queue.verify(store)?;
                let mut walk_err: Option<Error> = None;
                queue.for_each(store, &mut |node_recid, node| {
                    if walk_err.is_some() {
                        return;
                    }
                    match expected_nodes.remove(&node_recid) {
                        Some(leaf_recid) if leaf_recid == node.value => {}
                        Some(leaf_recid) => {
                            walk_err = Some(Error::corruption(format!(
                                "queue node {} points at leaf {} but a triple in leaf {} owns it",
                                node_recid, node.value, leaf_recid
                            )));
                        }
                        None => {
                            walk_err = Some(Error::corruption(format!(
                                "queue node {} is referenced by no leaf triple",
                                node_recid
                            )));
                        }
                    }
                })?;
                if let Some(err) = walk_err {
                    return Err(err);
                }
            }

            if !expected_nodes.is_empty() {
                return Err(Error::corruption(format!(
                    "{} leaf expire ids have no backing queue node",
                    expected_nodes.len()
                )));
            }

            if seg.counter_recid != 0 {
                let counted = self.counter_get(&seg, store)?;
                if counted != triples {
                    return Err(Error::corruption(format!(
                        "segment {} counter reads {} but holds {} triples",
                        segment, counted, triples
                    )));
                }
            }
        }
        Ok(())
    }
}
