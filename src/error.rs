//! Error types for the cache engine.
//!
//! Every engine operation returns [`Result`]. Expected conditions (missing,
//! expired or existing keys, an exhausted size budget, a short buffer) are
//! ordinary variants; only [`CacheError::Internal`] signals a broken
//! index/arena invariant.

use thiserror::Error;

/// Errors returned by the cache engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The router could not resolve a shard for the key
    #[error("no shard resolved for key")]
    NoShard,

    /// Allocating storage would exceed the size budget
    #[error("no space: {requested} bytes requested, {available} bytes available")]
    NoSpace { requested: u64, available: u64 },

    /// Index and arena disagree, or a shard lock was poisoned
    #[error("internal error: {0}")]
    Internal(String),

    /// No entry stored under the key
    #[error("key not found")]
    KeyNotFound,

    /// The entry outlived its TTL and has been removed
    #[error("key expired")]
    KeyExpired,

    /// A live entry already exists and overwrite is disabled
    #[error("key already exists")]
    KeyExists,

    /// The caller's buffer cannot hold the entry
    #[error("buffer too small: entry is {required} bytes, buffer holds {capacity}")]
    BufLenLow { required: usize, capacity: usize },

    /// The engine has been closed
    #[error("cache is closed")]
    CacheClosed,

    /// The configuration was rejected at construction
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Stable numeric code for binding layers.
    ///
    /// Codes never change between releases. `0` is reserved for success and
    /// never returned here.
    pub fn code(&self) -> u8 {
        match self {
            CacheError::NoShard => 1,
            CacheError::NoSpace { .. } => 2,
            CacheError::Internal(_) => 3,
            CacheError::KeyNotFound => 4,
            CacheError::KeyExpired => 5,
            CacheError::KeyExists => 6,
            CacheError::BufLenLow { .. } => 7,
            CacheError::CacheClosed => 8,
            CacheError::InvalidConfig(_) => 9,
        }
    }

    /// Returns true for the two miss conditions of a read.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::KeyNotFound | CacheError::KeyExpired)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, CacheError>;
