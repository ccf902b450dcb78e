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

//! Store-backed expiration queue
//!
//! A doubly-linked list of `(timestamp, value)` nodes, each node a 32-byte
//! store record addressed by its recid. The list is ordered by insertion,
//! not by timestamp; [`ExpireQueue::take_until`] consumes the matching
//! prefix in that order, which gives FIFO eviction for entries sharing a
//! TTL.
//!
//! `value` is the recid of the leaf record owning the entry. Timestamp `0`
//! means the node never time-expires and is purged only by size caps.
//!
//! All methods take the segment's store explicitly; the queue itself holds
//! only the head/tail recids and a length. Callers hold the segment write
//! lock for every mutating call.

use crate::core::{Error, Result};
use crate::store::Store;

/// One queue node as stored in a 32-byte record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueNode {
    pub prev: u64,
    pub next: u64,
    pub timestamp: i64,
    pub value: u64,
}

impl QueueNode {
    fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.prev.to_le_bytes());
        buf[8..16].copy_from_slice(&self.next.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<QueueNode> {
        if data.len() != 32 {
            return Err(Error::corruption(format!(
                "queue node record has {} bytes, expected 32",
                data.len()
            )));
        }
        let word = |range: std::ops::Range<usize>| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[range]);
            u64::from_le_bytes(bytes)
        };
        Ok(QueueNode {
            prev: word(0..8),
            next: word(8..16),
            timestamp: word(16..24) as i64,
            value: word(24..32),
        })
    }
}

/// Doubly-linked expiration queue, nodes stored as records
pub(crate) struct ExpireQueue {
    head: u64,
    tail: u64,
    len: u64,
}

impl ExpireQueue {
    pub fn new() -> Self {
        ExpireQueue {
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn load(&self, store: &dyn Store, node_recid: u64) -> Result<QueueNode> {
        match store.get(node_recid)? {
            Some(data) => QueueNode::decode(&data),
            None => Err(Error::corruption(format!(
                "expiration queue node {} is not initialized",
                node_recid
            ))),
        }
    }

    fn save(&self, store: &dyn Store, node_recid: u64, node: &QueueNode) -> Result<()> {
        store.update(node_recid, &node.encode())
    }

    /// Append a node at the tail, allocating a fresh record
    pub fn push(&mut self, store: &dyn Store, timestamp: i64, value: u64) -> Result<u64> {
        let node = QueueNode {
            prev: self.tail,
            next: 0,
            timestamp,
            value,
        };
        let node_recid = store.put(&node.encode())?;
        self.link_tail(store, node_recid)?;
        Ok(node_recid)
    }

    /// Append a node at the tail, reusing a record freed by
    /// `remove(.., remove_node = false)`
    pub fn push_at(
        &mut self,
        store: &dyn Store,
        timestamp: i64,
        value: u64,
        node_recid: u64,
    ) -> Result<()> {
        let node = QueueNode {
            prev: self.tail,
            next: 0,
            timestamp,
            value,
        };
        store.update(node_recid, &node.encode())?;
        self.link_tail(store, node_recid)
    }

    fn link_tail(&mut self, store: &dyn Store, node_recid: u64) -> Result<()> {
        if self.tail != 0 {
            let mut old_tail = self.load(store, self.tail)?;
            old_tail.next = node_recid;
            self.save(store, self.tail, &old_tail)?;
        } else {
            self.head = node_recid;
        }
        self.tail = node_recid;
        self.len += 1;
        Ok(())
    }

    fn unlink(&mut self, store: &dyn Store, node_recid: u64, node: &QueueNode) -> Result<()> {
        if node.prev != 0 {
            let mut prev = self.load(store, node.prev)?;
            prev.next = node.next;
            self.save(store, node.prev, &prev)?;
        } else {
            if self.head != node_recid {
                return Err(Error::corruption(format!(
                    "queue node {} claims to be head but head is {}",
                    node_recid, self.head
                )));
            }
            self.head = node.next;
        }
        if node.next != 0 {
            let mut next = self.load(store, node.next)?;
            next.prev = node.prev;
            self.save(store, node.next, &next)?;
        } else {
            if self.tail != node_recid {
                return Err(Error::corruption(format!(
                    "queue node {} claims to be tail but tail is {}",
                    node_recid, self.tail
                )));
            }
            self.tail = node.prev;
        }
        self.len -= 1;
        Ok(())
    }

    /// Refresh a node's timestamp and move it to the tail
    pub fn bump(&mut self, store: &dyn Store, node_recid: u64, timestamp: i64) -> Result<()> {
        let mut node = self.load(store, node_recid)?;
        if node_recid == self.tail {
            node.timestamp = timestamp;
            return self.save(store, node_recid, &node);
        }
        self.unlink(store, node_recid, &node)?;
        node.prev = self.tail;
        node.next = 0;
        node.timestamp = timestamp;
        self.save(store, node_recid, &node)?;
        self.link_tail(store, node_recid)
    }

    /// Unlink a node. When `remove_node` the record is deleted as well;
    /// otherwise the recid stays allocated for reuse via [`Self::push_at`].
    pub fn remove(
        &mut self,
        store: &dyn Store,
        node_recid: u64,
        remove_node: bool,
    ) -> Result<QueueNode> {
        let node = self.load(store, node_recid)?;
        self.unlink(store, node_recid, &node)?;
        if remove_node {
            store.delete(node_recid)?;
        }
        Ok(node)
    }

    /// Consume the longest prefix of nodes for which `pred` returns true,
    /// deleting their records. Returns the consumed `(node_recid, node)`
    /// pairs in queue order.
    pub fn take_until(
        &mut self,
        store: &dyn Store,
        mut pred: impl FnMut(u64, &QueueNode) -> bool,
    ) -> Result<Vec<(u64, QueueNode)>> {
        let mut taken = Vec::new();
        while self.head != 0 {
            let node_recid = self.head;
            let node = self.load(store, node_recid)?;
            if !pred(node_recid, &node) {
                break;
            }
            self.unlink(store, node_recid, &node)?;
            store.delete(node_recid)?;
            taken.push((node_recid, node));
        }
        Ok(taken)
    }

    /// Delete every node record and reset the queue
    pub fn clear(&mut self, store: &dyn Store) -> Result<()> {
        let mut recid = self.head;
        while recid != 0 {
            let node = self.load(store, recid)?;
            store.delete(recid)?;
            recid = node.next;
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
        Ok(())
    }

    /// Visit every `(node_recid, node)` in queue order
    pub fn for_each(
        &self,
        store: &dyn Store,
        f: &mut dyn FnMut(u64, &QueueNode),
    ) -> Result<()> {
        let mut recid = self.head;
        while recid != 0 {
            let node = self.load(store, recid)?;
            f(recid, &node);
            recid = node.next;
        }
        Ok(())
    }

    /// Check link consistency: prev/next pointers mirror each other, the
    /// ends match head/tail, and the node count matches `len`
    pub fn verify(&self, store: &dyn Store) -> Result<()> {
        let mut count: u64 = 0;
        let mut prev_recid = 0u64;
        let mut recid = self.head;
        while recid != 0 {
            let node = self.load(store, recid)?;
            if node.prev != prev_recid {
                return Err(Error::corruption(format!(
                    "queue node {} has prev {} but should be {}",
                    recid, node.prev, prev_recid
                )));
            }
            count += 1;
            if count > self.len {
                return Err(Error::corruption("queue walk exceeds recorded length"));
            }
            prev_recid = recid;
            recid = node.next;
        }
        if prev_recid != self.tail {
            return Err(Error::corruption(format!(
                "queue tail is {} but walk ended at {}",
                self.tail, prev_recid
            )));
        }
        if count != self.len {
            return Err(Error::corruption(format!(
                "queue length {} does not match walked nodes {}",
                self.len, count
            )));
        }
        Ok(())
    }
}
