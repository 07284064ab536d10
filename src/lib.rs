//! # ShardCache - An Embedded, Sharded Byte Cache
//!
//! ShardCache stores opaque byte values under byte-string keys, in memory,
//! with a time-to-live on every entry. It is built for many threads setting
//! and reading at once without a global lock.
//!
//! ## Features
//!
//! - **Sharded**: keys hash onto a power-of-two number of shards, each with
//!   its own reader/writer lock
//! - **Page Arenas**: values are appended into fixed-size pages instead of
//!   being allocated one by one, and pages are recycled as a whole
//! - **Bounded**: one atomic budget caps page memory across all shards; a
//!   write that would exceed it fails with `NoSpace` rather than evicting
//!   anything
//! - **TTL Expiry**: expired entries are removed lazily on read, by a
//!   background sweep once per TTL and by the periodic vacuum
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CacheEngine                            │
//! │                                                                  │
//! │   set/get/delete ──> ShardRouter ──> Shard ──┬─> KeyIndex        │
//! │                      (hash & mask)  (RwLock) └─> PageArena       │
//! │                                                    │             │
//! │                                                    ▼             │
//! │                                              SizeBudget          │
//! │                                            (AtomicU64, CAS)      │
//! │                                                                  │
//! │   VacuumScheduler ──> every shard in turn: drop expired          │
//! │   (Tokio task)        entries, reclaim empty pages               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use shardcache::{CacheConfig, CacheEngine, CacheError};
//! use std::time::Duration;
//!
//! let config = CacheConfig::new(Duration::from_secs(60))
//!     .with_shard_count(8)
//!     .with_max_size(10 * 1024 * 1024)
//!     .with_vacuum_interval(Duration::ZERO);
//! let cache = CacheEngine::new(config).unwrap();
//!
//! cache.set("k1", br#"{"id":1}"#).unwrap();
//!
//! // Size the buffer from the stored length
//! let mut buf = vec![0u8; cache.entry_len("k1").unwrap()];
//! let n = cache.get("k1", &mut buf).unwrap();
//! assert_eq!(&buf[..n], br#"{"id":1}"#);
//!
//! // Writing a live key again is refused unless force_set is on
//! assert_eq!(cache.set("k1", b"other"), Err(CacheError::KeyExists));
//!
//! cache.close().unwrap();
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: engine configuration and verbosity levels
//! - [`error`]: the error type and its numeric codes
//! - [`storage`]: shards, arenas, the router, the vacuum and the engine
//!
//! ## Design Highlights
//!
//! ### Append-Only Pages
//!
//! A set never rewrites bytes in place. Overwritten, deleted and expired
//! values become dead space in their page; the expiry sweep or the vacuum
//! reclaims a page once nothing on it is live.
//!
//! ### Explicit Lengths
//!
//! Reads copy into a caller buffer and return the byte count, so values may
//! contain any bytes, zeros included.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{CacheConfig, Verbosity};
pub use error::{CacheError, Result};
pub use storage::{CacheEngine, EngineStats, ShardStats, SweepReport, VacuumReport};

/// Version of ShardCache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
