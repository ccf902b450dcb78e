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

//! Sparse directory tree mapping 64-bit indices to leaf recids
//!
//! One tree per segment. The key space is fixed at construction by
//! `(dir_shift, levels)`: each level is a directory of `1 << dir_shift`
//! slots, the root consuming the most significant chunk of the index.
//! Directories materialize on insert and are pruned when their last entry
//! is removed, so an empty segment is a single empty root directory.
//!
//! Recid `0` never appears as a stored value; `get` returns `0` for an
//! absent index.

use crate::core::{Error, Result};

enum Slot {
    Empty,
    Child(Box<Dir>),
    Value(u64),
}

struct Dir {
    slots: Vec<Slot>,
    /// Non-empty slots, so prune checks are O(1)
    used: usize,
}

impl Dir {
    fn new(dir_shift: u32) -> Self {
        let width = 1usize << dir_shift;
        let mut slots = Vec::with_capacity(width);
        slots.resize_with(width, || Slot::Empty);
        Dir { slots, used: 0 }
    }
}

/// Sparse `u64 index -> u64 recid` mapping with fixed geometry
pub(crate) struct IndexTree {
    dir_shift: u32,
    levels: u32,
    index_mask: u64,
    root: Dir,
    len: usize,
}

impl IndexTree {
    /// Create an empty tree addressing `(1 << dir_shift)^levels` indices
    pub fn new(dir_shift: u32, levels: u32) -> Self {
        debug_assert!(dir_shift >= 1 && levels >= 1);
        debug_assert!(dir_shift * levels <= 64);
        let bits = dir_shift * levels;
        let index_mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        IndexTree {
            dir_shift,
            levels,
            index_mask,
            root: Dir::new(dir_shift),
            len: 0,
        }
    }

    fn chunk(&self, index: u64, depth: u32) -> usize {
        let shift = (self.levels - 1 - depth) * self.dir_shift;
        ((index >> shift) & ((1u64 << self.dir_shift) - 1)) as usize
    }

    /// Look up `index`, returning `0` if absent
    pub fn get(&self, index: u64) -> u64 {
        if index > self.index_mask {
            return 0;
        }
        let mut dir = &self.root;
        for depth in 0..self.levels {
            let slot = &dir.slots[self.chunk(index, depth)];
            match slot {
                Slot::Empty => return 0,
                Slot::Child(child) => dir = child,
                Slot::Value(recid) => return *recid,
            }
        }
        0
    }

    /// Insert or overwrite `index -> recid`, returning the previous recid
    pub fn put(&mut self, index: u64, recid: u64) -> Result<Option<u64>> {
        if recid == 0 {
            return Err(Error::invalid_argument("recid 0 is reserved"));
        }
        if index > self.index_mask {
            return Err(Error::invalid_argument(format!(
                "index {} exceeds tree capacity {}",
                index, self.index_mask
            )));
        }
        let levels = self.levels;
        let dir_shift = self.dir_shift;
        let mut dir = &mut self.root;
        for depth in 0..levels {
            let shift = (levels - 1 - depth) * dir_shift;
            let chunk = ((index >> shift) & ((1u64 << dir_shift) - 1)) as usize;
            if depth == levels - 1 {
                let slot = &mut dir.slots[chunk];
                let old = match slot {
                    Slot::Value(old) => Some(*old),
                    _ => None,
                };
                if old.is_none() {
                    dir.used += 1;
                    self.len += 1;
                }
                *slot = Slot::Value(recid);
                return Ok(old);
            }
            if matches!(dir.slots[chunk], Slot::Empty) {
                dir.slots[chunk] = Slot::Child(Box::new(Dir::new(dir_shift)));
                dir.used += 1;
            }
            dir = match &mut dir.slots[chunk] {
                Slot::Child(child) => child,
                _ => {
                    return Err(Error::corruption(
                        "index tree holds a value above the leaf level",
                    ))
                }
            };
        }
        Err(Error::internal("index tree with zero levels"))
    }

    /// Remove `index`, returning the recid that was stored there
    pub fn remove(&mut self, index: u64) -> Option<u64> {
        if index > self.index_mask {
            return None;
        }
        let levels = self.levels;
        let removed = Self::remove_rec(&mut self.root, index, 0, levels, self.dir_shift);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_rec(dir: &mut Dir, index: u64, depth: u32, levels: u32, dir_shift: u32) -> Option<u64> {
        let shift = (levels - 1 - depth) * dir_shift;
        let chunk = ((index >> shift) & ((1u64 << dir_shift) - 1)) as usize;
        if depth == levels - 1 {
            let slot = &mut dir.slots[chunk];
            if let Slot::Value(recid) = slot {
                let recid = *recid;
                *slot = Slot::Empty;
                dir.used -= 1;
                return Some(recid);
            }
            return None;
        }
        match &mut dir.slots[chunk] {
            Slot::Child(child) => {
                let removed = Self::remove_rec(child, index, depth + 1, levels, dir_shift)?;
                if child.used == 0 {
                    // Child directory drained, prune it
                    dir.slots[chunk] = Slot::Empty;
                    dir.used -= 1;
                }
                Some(removed)
            }
            _ => None,
        }
    }

    /// Number of stored indices
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no index is stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Visit every `(index, recid)` pair in index order
    pub fn for_each(&self, f: &mut dyn FnMut(u64, u64)) {
        Self::for_each_rec(&self.root, self.dir_shift, 0, f);
    }

    fn for_each_rec(dir: &Dir, dir_shift: u32, prefix: u64, f: &mut dyn FnMut(u64, u64)) {
        for (i, slot) in dir.slots.iter().enumerate() {
            let index = (prefix << dir_shift) | i as u64;
            match slot {
                Slot::Empty => {}
                Slot::Value(recid) => f(index, *recid),
                Slot::Child(child) => Self::for_each_rec(child, dir_shift, index, f),
            }
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.root = Dir::new(self.dir_shift);
        self.len = 0;
    }

    /// Check structural invariants: values only at the leaf level, no empty
    /// child directories, `used` counters and `len` consistent
    pub fn verify(&self) -> Result<()> {
        let counted = Self::verify_rec(&self.root, 0, self.levels)?;
        if counted != self.len {
            return Err(Error::corruption(format!(
                "index tree len {} does not match counted entries {}",
                self.len, counted
            )));
        }
        Ok(())
    }

    fn verify_rec(dir: &Dir, depth: u32, levels: u32) -> Result<usize> {
        let mut used = 0;
        let mut values = 0;
        for slot in &dir.slots {
            match slot {
                Slot::Empty => {}
                Slot::Value(recid) => {
                    if depth != levels - 1 {
                        return Err(Error::corruption(
                            "index tree holds a value above the leaf level",
                        ));
                    }
                    if *recid == 0 {
                        return Err(Error::corruption("index tree holds recid 0"));
                    }
                    used += 1;
                    values += 1;
                }
                Slot::Child(child) => {
                    if depth >= levels - 1 {
                        return Err(Error::corruption(
                            "index tree holds a directory at the leaf level",
                        ));
                    }
                    if child.used == 0 {
                        return Err(Error::corruption("index tree holds an empty directory"));
                    }
                    used += 1;
                    values += Self::verify_rec(child, depth + 1, levels)?;
                }
            }
        }
        if used != dir.used {
            return Err(Error::corruption(format!(
                "directory used counter {} does not match occupied slots {}",
                dir.used, used
            )));
        }
        Ok(values)
    }
}
