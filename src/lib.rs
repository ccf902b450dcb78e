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

//! # Shardmap - Concurrent, segmented, persistable hash map
//!
//! Shardmap is a building block for embedded storage engines: a hash map
//! whose entries live as serialized records in a pluggable, recid-addressed
//! blob store. Keys are routed through a sparse index tree per segment, each
//! segment guarded by its own reader/writer lock.
//!
//! ## Key Features
//!
//! - **Segmented concurrency** - `1 << conc_shift` independent shards, each
//!   with its own store, index tree, expiration queues and RW-lock
//! - **Persistable records** - keys and values are serialized through
//!   pluggable codecs into any [`Store`] backend
//! - **TTL expiration** - per-entry time-to-live on creation, update and/or
//!   access, tracked by per-segment linked expiration queues
//! - **Size caps** - maximum entry count and maximum store size, enforced by
//!   foreground or background eviction
//! - **Value handling** - values inlined into leaf records or stored as
//!   separate records; key-set mode for map-backed sets
//! - **Modification listeners** - change notifications with an
//!   eviction/loader `triggered` flag
//!
//! ## Quick Start
//!
//! ```rust
//! use shardmap::{I64Codec, ShardMap, StrCodec};
//!
//! let map = ShardMap::builder()
//!     .key_codec(StrCodec)
//!     .value_codec(I64Codec)
//!     .build()
//!     .unwrap();
//!
//! map.put("a".to_string(), 1).unwrap();
//! assert_eq!(map.get(&"a".to_string()).unwrap(), Some(1));
//! assert_eq!(map.remove(&"a".to_string()).unwrap(), Some(1));
//! ```
//!
//! ## Modules
//!
//! - [`map`] - The segmented map itself ([`ShardMap`], [`Builder`])
//! - [`store`] - Recid-addressed blob store contract and [`MemStore`]
//! - [`core`] - Error types, codecs, hashing

pub mod core;
pub mod map;
pub mod store;

// Re-export main types for convenience
pub use crate::core::{Error, Result};

// Re-export codec types
pub use crate::core::{BytesCodec, Codec, I64Codec, StrCodec, U64Codec, UnitCodec};

// Re-export hashing types
pub use crate::core::{DefaultHashOps, HashOps};

// Re-export store types
pub use store::{MemStore, Store};

// Re-export map types
pub use map::{
    Builder, ClearMode, Iter, Keys, ModificationListener, ShardMap, Values, EXPIRE_NEVER,
};
