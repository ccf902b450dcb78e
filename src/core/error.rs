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

//! Error types for Shardmap
//!
//! This module defines all error types surfaced by the map, the store and
//! the codec layer.

use thiserror::Error;

/// Result type alias for Shardmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Shardmap operations
///
/// Covers caller mistakes (invalid arguments, illegal states), lifecycle
/// errors (closed map/store) and non-recoverable data corruption detected
/// in the store, the index tree or the expiration queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Argument and state errors
    // =========================================================================
    /// Invalid argument supplied to an operation or to the builder
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not legal in the current state
    #[error("illegal state: {0}")]
    IllegalState(String),

    // =========================================================================
    // Lifecycle errors
    // =========================================================================
    /// The map has been closed
    #[error("map is closed")]
    MapClosed,

    /// The backing store has been closed
    #[error("store is closed")]
    StoreClosed,

    // =========================================================================
    // Data errors
    // =========================================================================
    /// Non-recoverable inconsistency between the index tree, leaf records
    /// and expiration queues
    #[error("data corruption: {message}")]
    Corruption { message: String },

    /// A recid did not resolve to an allocated store record
    #[error("recid {recid} is not allocated in the store")]
    RecidNotAllocated { recid: u64 },

    // =========================================================================
    // Other errors
    // =========================================================================
    /// IO error (wrapped)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a new IllegalState error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    /// Create a new Corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption {
            message: message.into(),
        }
    }

    /// Create a new IO error
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io {
            message: message.into(),
        }
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a data corruption error
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption { .. } | Error::RecidNotAllocated { .. }
        )
    }

    /// Check if this is a caller error (invalid argument or illegal state)
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::IllegalState(_))
    }

    /// Check if this is a closed map/store lifecycle error
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::MapClosed | Error::StoreClosed)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
        }
    }
}
