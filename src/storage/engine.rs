//! Cache Engine
//!
//! [`CacheEngine`] is the public face of the cache. It validates the
//! configuration, builds the shards, starts the background expiry and vacuum
//! passes and routes every call
//! to the shard that owns the key.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CacheEngine                           │
//! │            SizeBudget (one AtomicU64, CAS reserve)           │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐      ┌──────────┐    │
//! │  │ Shard 0  │ │ Shard 1  │ │ Shard 2  │ ...  │ Shard N  │    │
//! │  │ RwLock   │ │ RwLock   │ │ RwLock   │      │ RwLock   │    │
//! │  │ KeyIndex │ │ KeyIndex │ │ KeyIndex │      │ KeyIndex │    │
//! │  │ Arena    │ │ Arena    │ │ Arena    │      │ Arena    │    │
//! │  └──────────┘ └──────────┘ └──────────┘      └──────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//!                               ▲
//!                ┌──────────────┴──────────────┐
//!                │       VacuumScheduler       │
//!                │ expiry + vacuum, Tokio task │
//!                │     or dedicated thread     │
//!                └─────────────────────────────┘
//! ```
//!
//! Calls on different shards never contend. The only state shared between
//! shards is the size budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::config::{CacheConfig, Verbosity};
use crate::error::{CacheError, Result};
use crate::storage::budget::SizeBudget;
use crate::storage::router::ShardRouter;
use crate::storage::vacuum::{self, Schedule, SweepReport, VacuumScheduler};

/// State shared between the engine handle and the vacuum task.
#[derive(Debug)]
pub(crate) struct Core {
    router: ShardRouter,
    budget: Arc<SizeBudget>,
    config: CacheConfig,
    closed: AtomicBool,

    /// Statistics: total set calls
    set_count: AtomicU64,

    /// Statistics: total get calls
    get_count: AtomicU64,

    /// Statistics: gets that returned a value
    hit_count: AtomicU64,

    /// Statistics: gets that found nothing or an expired entry
    miss_count: AtomicU64,

    /// Statistics: deletes that removed an entry
    del_count: AtomicU64,

    /// Statistics: completed vacuum passes
    vacuum_count: AtomicU64,

    /// Statistics: completed expiry passes
    expiry_count: AtomicU64,
}

impl Core {
    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs one vacuum pass over every shard.
    pub(crate) fn sweep(&self) -> SweepReport {
        let report = vacuum::sweep(&self.router, self.config.verbosity);
        self.vacuum_count.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Runs one expiry pass over every shard.
    pub(crate) fn expire(&self) -> SweepReport {
        let report = vacuum::expire(&self.router, self.config.verbosity);
        self.expiry_count.fetch_add(1, Ordering::Relaxed);
        report
    }

    fn record_get<T>(&self, result: &Result<T>) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(_) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.is_miss() => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

/// A sharded, page-arena byte cache.
///
/// # Example
///
/// ```
/// use shardcache::{CacheConfig, CacheEngine, CacheError};
/// use std::time::Duration;
///
/// let config = CacheConfig::new(Duration::from_secs(60))
///     .with_shard_count(8)
///     .with_max_size(10 * 1024 * 1024)
///     .with_vacuum_interval(Duration::ZERO);
/// let cache = CacheEngine::new(config).unwrap();
///
/// cache.set("greeting", b"hello").unwrap();
///
/// let mut buf = [0u8; 16];
/// let n = cache.get("greeting", &mut buf).unwrap();
/// assert_eq!(&buf[..n], b"hello");
///
/// assert_eq!(cache.get("missing", &mut buf), Err(CacheError::KeyNotFound));
/// cache.close().unwrap();
/// ```
pub struct CacheEngine {
    core: Arc<Core>,
    vacuum: Mutex<Option<VacuumScheduler>>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("shards", &self.core.router.len())
            .field("max_size", &self.core.budget.max())
            .field("used", &self.core.budget.used())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

impl CacheEngine {
    /// Creates an engine and starts its background passes.
    ///
    /// Expired entries are swept once per configured TTL. The vacuum runs on
    /// its own interval unless that interval is zero.
    ///
    /// Fails with `InvalidConfig` if the configuration is rejected.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let max_size = config.resolved_max_size();
        let page_size = config
            .resolved_page_size(max_size)
            .min(usize::try_from(max_size).unwrap_or(usize::MAX))
            .max(1);
        let budget = Arc::new(SizeBudget::new(max_size));
        let router = ShardRouter::new(
            config.shard_count,
            page_size,
            config.free_page_pool,
            Arc::clone(&budget),
            config.verbosity,
        )?;

        let schedule = Schedule::new(config.ttl, config.vacuum_interval);
        let verbosity = config.verbosity;
        let core = Arc::new(Core {
            router,
            budget,
            config,
            closed: AtomicBool::new(false),
            set_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            vacuum_count: AtomicU64::new(0),
            expiry_count: AtomicU64::new(0),
        });

        let scheduler = VacuumScheduler::start(Arc::clone(&core), schedule)?;

        if verbosity.includes(Verbosity::Debug1) {
            info!(
                shards = core.router.len(),
                max_size,
                page_size,
                ttl_ms = core.config.ttl.as_millis() as u64,
                force_set = core.config.force_set,
                "cache engine created"
            );
        }

        Ok(Self {
            core,
            vacuum: Mutex::new(Some(scheduler)),
        })
    }

    /// Stores `data` under `key` with the configured TTL.
    ///
    /// With `force_set` off, a live entry under `key` fails with `KeyExists`
    /// and keeps its value. An exhausted size budget fails with `NoSpace` and
    /// changes nothing.
    pub fn set(&self, key: impl AsRef<[u8]>, data: &[u8]) -> Result<()> {
        self.set_with_ttl(key, data, self.core.config.ttl)
    }

    /// Stores `data` under `key`, expiring it after `ttl`.
    pub fn set_with_ttl(&self, key: impl AsRef<[u8]>, data: &[u8], ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        self.core.set_count.fetch_add(1, Ordering::Relaxed);

        let key = key.as_ref();
        self.core
            .router
            .shard(key)?
            .set(key, data, ttl, self.core.config.force_set)
    }

    /// Copies the value of `key` into `buf` and returns its length.
    ///
    /// Fails with `BufLenLow` if `buf` is shorter than the value; the error
    /// carries the length needed. An entry whose TTL has passed is removed
    /// and reported as `KeyExpired`.
    pub fn get(&self, key: impl AsRef<[u8]>, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let key = key.as_ref();
        let result = self.core.router.shard(key)?.get(key, buf);
        self.core.record_get(&result);
        result
    }

    /// Returns a copy of the value of `key`.
    pub fn get_owned(&self, key: impl AsRef<[u8]>) -> Result<Bytes> {
        self.ensure_open()?;
        let key = key.as_ref();
        let result = self.core.router.shard(key)?.get_owned(key);
        self.core.record_get(&result);
        result
    }

    /// Returns the length of the value of `key`, for sizing a buffer.
    pub fn entry_len(&self, key: impl AsRef<[u8]>) -> Result<usize> {
        self.ensure_open()?;
        let key = key.as_ref();
        self.core.router.shard(key)?.entry_len(key)
    }

    /// Removes `key`. Returns true if an entry was removed.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.ensure_open()?;
        let key = key.as_ref();
        let removed = self.core.router.shard(key)?.delete(key)?;
        if removed {
            self.core.del_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Runs a vacuum pass now, with the same semantics as a scheduled one.
    pub fn vacuum(&self) -> Result<SweepReport> {
        self.ensure_open()?;
        Ok(self.core.sweep())
    }

    /// Runs an expiry pass now, removing every expired entry and the pages
    /// it leaves empty.
    pub fn expire(&self) -> Result<SweepReport> {
        self.ensure_open()?;
        Ok(self.core.expire())
    }

    /// Clears the degraded flag of shard `id` so vacuum visits it again.
    pub fn reset_shard(&self, id: usize) -> Result<()> {
        self.ensure_open()?;
        let shard = self.core.router.get(id)?;
        shard.reset();
        if self.core.config.verbosity.includes(Verbosity::Debug1) {
            info!(shard = id, "shard reset");
        }
        Ok(())
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats> {
        self.ensure_open()?;
        let core = &self.core;
        let mut stats = EngineStats {
            shards: core.router.len(),
            max_size: core.budget.max(),
            resident_bytes: core.budget.used(),
            sets: core.set_count.load(Ordering::Relaxed),
            gets: core.get_count.load(Ordering::Relaxed),
            hits: core.hit_count.load(Ordering::Relaxed),
            misses: core.miss_count.load(Ordering::Relaxed),
            deletes: core.del_count.load(Ordering::Relaxed),
            vacuum_passes: core.vacuum_count.load(Ordering::Relaxed),
            expiry_passes: core.expiry_count.load(Ordering::Relaxed),
            ..EngineStats::default()
        };

        for shard in core.router.shards() {
            let shard_stats = shard.stats()?;
            stats.entries += shard_stats.entries;
            stats.pages += shard_stats.pages;
            stats.pooled_pages += shard_stats.pooled_pages;
            stats.live_bytes += shard_stats.live_bytes;
            stats.expired += shard_stats.expired;
            if shard_stats.degraded {
                stats.degraded_shards += 1;
            }
        }
        Ok(stats)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Stops the vacuum and releases all storage.
    ///
    /// Every later call, including a second `close`, fails with
    /// `CacheClosed`. Calls already running finish against the state they
    /// hold or fail with `CacheClosed`.
    pub fn close(&self) -> Result<()> {
        if self
            .core
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CacheError::CacheClosed);
        }

        let scheduler = self
            .vacuum
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }

        let released: u64 = self.core.router.shards().iter().map(|s| s.close()).sum();

        if self.core.config.verbosity.includes(Verbosity::Debug1) {
            info!(released, "cache engine closed");
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.core.is_closed() {
            return Err(CacheError::CacheClosed);
        }
        Ok(())
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if !self.core.is_closed() {
            let _ = self.close();
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of shards
    pub shards: usize,
    /// Live entries across all shards
    pub entries: usize,
    /// Pages in use
    pub pages: usize,
    /// Reclaimed pages held for reuse
    pub pooled_pages: usize,
    /// Page capacity charged to the size budget
    pub resident_bytes: u64,
    /// Bytes held by live entries
    pub live_bytes: u64,
    /// Size budget
    pub max_size: u64,
    /// Total set calls
    pub sets: u64,
    /// Total get calls
    pub gets: u64,
    /// Gets that returned a value
    pub hits: u64,
    /// Gets that missed or found an expired entry
    pub misses: u64,
    /// Entries removed because their TTL passed
    pub expired: u64,
    /// Deletes that removed an entry
    pub deletes: u64,
    /// Completed vacuum passes
    pub vacuum_passes: u64,
    /// Completed expiry passes
    pub expiry_passes: u64,
    /// Shards currently marked degraded
    pub degraded_shards: usize,
}

impl EngineStats {
    /// Fraction of gets that hit, zero before the first get.
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            return 0.0;
        }
        self.hits as f64 / self.gets as f64
    }
}
