//! Storage Module
//!
//! The layers of the cache, from the bottom up:
//!
//! - [`budget`]: the global size counter shared by every shard
//! - [`arena`]: fixed-capacity pages holding entry bytes
//! - [`index`]: key to entry descriptor map
//! - [`shard`]: one index and one arena behind a reader/writer lock
//! - [`router`]: hashes keys onto shards
//! - [`vacuum`]: the background expiry and vacuum passes
//! - [`engine`]: the public [`CacheEngine`]
//!
//! ## Example
//!
//! ```
//! use shardcache::storage::CacheEngine;
//! use shardcache::CacheConfig;
//! use std::time::Duration;
//!
//! let cache = CacheEngine::new(
//!     CacheConfig::default()
//!         .with_shard_count(8)
//!         .with_max_size(1024 * 1024)
//!         .with_vacuum_interval(Duration::ZERO),
//! )
//! .unwrap();
//!
//! // Set with a one hour TTL
//! cache
//!     .set_with_ttl("session", b"token123", Duration::from_secs(3600))
//!     .unwrap();
//! assert_eq!(cache.entry_len("session").unwrap(), 8);
//! ```

pub mod arena;
pub mod budget;
pub mod engine;
pub mod index;
pub mod router;
pub mod shard;
pub mod vacuum;

// Re-export commonly used types
pub use engine::{CacheEngine, EngineStats};
pub use shard::{ShardStats, VacuumReport};
pub use vacuum::SweepReport;
