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

//! Recid-addressed blob storage
//!
//! A [`Store`] maps opaque 64-bit record ids to byte blobs. The map keeps
//! one store handle per segment; handles may alias the same backing store.
//! Recid `0` is reserved and never allocated, so it can serve as the
//! universal "absent" sentinel in index trees and leaf records.

pub mod mem;

pub use mem::MemStore;

use crate::core::Result;

/// Recid-addressed blob store
///
/// Implementations use interior mutability (`&self` methods) and must be
/// safe for concurrent use; the map serializes access per segment but
/// stores may be shared between segments.
///
/// The sizing surface (`file_tail`, `free_size`, `total_size`, `compact`)
/// is optional. It is only consulted when size-based eviction or
/// compaction is configured; stores that cannot report sizes return `None`
/// and those features are rejected at map construction.
pub trait Store: Send + Sync {
    /// Insert a new record, returning its recid (never 0)
    fn put(&self, data: &[u8]) -> Result<u64>;

    /// Fetch a record. Returns `None` for a preallocated recid that has not
    /// been written yet; unallocated recids are an error.
    fn get(&self, recid: u64) -> Result<Option<Vec<u8>>>;

    /// Overwrite an existing (or preallocated) record
    fn update(&self, recid: u64, data: &[u8]) -> Result<()>;

    /// Reserve a recid whose contents are uninitialized until the first
    /// `update`
    fn preallocate(&self) -> Result<u64>;

    /// Delete a record, releasing its recid for reuse
    fn delete(&self, recid: u64) -> Result<()>;

    /// True once the store has been closed
    fn is_closed(&self) -> bool {
        false
    }

    /// High-water mark of bytes ever written, if the store tracks sizes
    fn file_tail(&self) -> Option<u64> {
        None
    }

    /// Bytes occupied by deleted or superseded records, if tracked
    fn free_size(&self) -> Option<u64> {
        None
    }

    /// Total store footprint in bytes, if tracked
    fn total_size(&self) -> Option<u64> {
        None
    }

    /// Reclaim free space. A no-op for stores without garbage.
    fn compact(&self) -> Result<()> {
        Ok(())
    }
}
