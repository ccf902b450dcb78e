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

//! Core types shared across the crate
//!
//! - [`Error`] / [`Result`] - crate-wide error handling
//! - [`Codec`] - serializer seam for keys, values and leaf records
//! - [`HashOps`] - seeded hashing and equality for keys and values

pub mod codec;
pub mod error;
pub mod hash;
pub mod time;

pub use codec::{
    pack_u64, unpack_u64, BytesCodec, Codec, I64Codec, StrCodec, U64Codec, UnitCodec,
};
pub use error::{Error, Result};
pub use hash::{DefaultHashOps, HashOps};
pub use time::now_millis;
