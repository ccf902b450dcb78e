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

//! In-memory store backed by a slot vector with recid reuse
//!
//! Byte accounting models an append-only file: `put` and `update` advance
//! the tail, `delete` and `update` add the superseded bytes to the free
//! total, and `compact` folds the free space back in. This is what makes
//! size-capped eviction and the compaction threshold exercisable without a
//! disk-backed store.

use parking_lot::RwLock;

use crate::core::{Error, Result};
use crate::store::Store;

enum Slot {
    /// Unallocated; recid is on the free list
    Vacant,
    /// Reserved by `preallocate`, reads back as `None` until updated
    Reserved,
    /// Live record
    Full(Vec<u8>),
}

struct MemStoreInner {
    slots: Vec<Slot>,
    free: Vec<u64>,
    /// High-water mark of bytes appended (put + update)
    tail_bytes: u64,
    /// Bytes in deleted or superseded records, not yet compacted
    freed_bytes: u64,
    /// Allocated records (reserved + full)
    record_count: usize,
    closed: bool,
}

/// In-memory [`Store`] implementation
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl MemStore {
    /// Create an empty store
    pub fn new() -> Self {
        MemStore {
            inner: RwLock::new(MemStoreInner {
                slots: Vec::new(),
                free: Vec::new(),
                tail_bytes: 0,
                freed_bytes: 0,
                record_count: 0,
                closed: false,
            }),
        }
    }

    /// Number of allocated records (including preallocated ones)
    pub fn record_count(&self) -> usize {
        self.inner.read().record_count
    }

    /// Close the store; subsequent operations fail with `StoreClosed`
    pub fn close(&self) {
        self.inner.write().closed = true;
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStoreInner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn alloc(&mut self, slot: Slot) -> u64 {
        self.record_count += 1;
        if let Some(recid) = self.free.pop() {
            self.slots[(recid - 1) as usize] = slot;
            recid
        } else {
            self.slots.push(slot);
            self.slots.len() as u64
        }
    }

    fn slot_mut(&mut self, recid: u64) -> Result<&mut Slot> {
        if recid == 0 || recid > self.slots.len() as u64 {
            return Err(Error::RecidNotAllocated { recid });
        }
        let slot = &mut self.slots[(recid - 1) as usize];
        if matches!(slot, Slot::Vacant) {
            return Err(Error::RecidNotAllocated { recid });
        }
        Ok(slot)
    }
}

impl Store for MemStore {
    fn put(&self, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        inner.tail_bytes += data.len() as u64;
        Ok(inner.alloc(Slot::Full(data.to_vec())))
    }

    fn get(&self, recid: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read();
        inner.check_open()?;
        if recid == 0 || recid > inner.slots.len() as u64 {
            return Err(Error::RecidNotAllocated { recid });
        }
        match &inner.slots[(recid - 1) as usize] {
            Slot::Vacant => Err(Error::RecidNotAllocated { recid }),
            Slot::Reserved => Ok(None),
            Slot::Full(data) => Ok(Some(data.clone())),
        }
    }

    fn update(&self, recid: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let new_len = data.len() as u64;
        let slot = inner.slot_mut(recid)?;
        let old_len = match slot {
            Slot::Full(old) => old.len() as u64,
            _ => 0,
        };
        *slot = Slot::Full(data.to_vec());
        inner.tail_bytes += new_len;
        inner.freed_bytes += old_len;
        Ok(())
    }

    fn preallocate(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        Ok(inner.alloc(Slot::Reserved))
    }

    fn delete(&self, recid: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let slot = inner.slot_mut(recid)?;
        let old_len = match slot {
            Slot::Full(old) => old.len() as u64,
            _ => 0,
        };
        *slot = Slot::Vacant;
        inner.freed_bytes += old_len;
        inner.record_count -= 1;
        inner.free.push(recid);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    fn file_tail(&self) -> Option<u64> {
        Some(self.inner.read().tail_bytes)
    }

    fn free_size(&self) -> Option<u64> {
        Some(self.inner.read().freed_bytes)
    }

    fn total_size(&self) -> Option<u64> {
        Some(self.inner.read().tail_bytes)
    }

    fn compact(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let live: u64 = inner
            .slots
            .iter()
            .map(|s| match s {
                Slot::Full(data) => data.len() as u64,
                _ => 0,
            })
            .sum();
        inner.tail_bytes = live;
        inner.freed_bytes = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemStore::new();
        let recid = store.put(b"hello").unwrap();
        assert_ne!(recid, 0);
        assert_eq!(store.get(recid).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_update() {
        let store = MemStore::new();
        let recid = store.put(b"a").unwrap();
        store.update(recid, b"bb").unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(b"bb".to_vec()));
    }

    #[test]
    fn test_preallocate_reads_none_until_update() {
        let store = MemStore::new();
        let recid = store.preallocate().unwrap();
        assert_eq!(store.get(recid).unwrap(), None);
        store.update(recid, b"now").unwrap();
        assert_eq!(store.get(recid).unwrap(), Some(b"now".to_vec()));
    }

    #[test]
    fn test_delete_and_recid_reuse() {
        let store = MemStore::new();
        let a = store.put(b"a").unwrap();
        store.delete(a).unwrap();
        assert!(store.get(a).is_err());
        let b = store.put(b"b").unwrap();
        assert_eq!(b, a, "freed recid should be reused");
    }

    #[test]
    fn test_unallocated_recid_is_error() {
        let store = MemStore::new();
        assert!(store.get(0).is_err());
        assert!(store.get(99).is_err());
        assert!(store.update(99, b"x").is_err());
        assert!(store.delete(99).is_err());
    }

    #[test]
    fn test_record_count() {
        let store = MemStore::new();
        assert_eq!(store.record_count(), 0);
        let a = store.put(b"a").unwrap();
        let _b = store.put(b"b").unwrap();
        let _c = store.preallocate().unwrap();
        assert_eq!(store.record_count(), 3);
        store.delete(a).unwrap();
        assert_eq!(store.record_count(), 2);
    }

    #[test]
    fn test_byte_accounting_and_compact() {
        let store = MemStore::new();
        let a = store.put(&[0u8; 100]).unwrap();
        let b = store.put(&[0u8; 50]).unwrap();
        assert_eq!(store.file_tail(), Some(150));
        assert_eq!(store.free_size(), Some(0));

        // Update appends the new version and frees the old
        store.update(a, &[0u8; 10]).unwrap();
        assert_eq!(store.file_tail(), Some(160));
        assert_eq!(store.free_size(), Some(100));

        store.delete(b).unwrap();
        assert_eq!(store.free_size(), Some(150));

        store.compact().unwrap();
        assert_eq!(store.free_size(), Some(0));
        assert_eq!(store.file_tail(), Some(10));
    }

    #[test]
    fn test_close() {
        let store = MemStore::new();
        let recid = store.put(b"x").unwrap();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.get(recid), Err(Error::StoreClosed)));
        assert!(matches!(store.put(b"y"), Err(Error::StoreClosed)));
    }
}
