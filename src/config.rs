//! Engine Configuration
//!
//! [`CacheConfig`] is fixed once an engine is built. It can be assembled with
//! the `with_*` setters, taken from the environment with
//! [`CacheConfig::from_env`], or built from the raw numbers a binding layer
//! hands over with [`CacheConfig::from_raw`].

use std::env;
use std::time::Duration;

use sysinfo::System;
use tracing::level_filters::LevelFilter;

use crate::error::{CacheError, Result};

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 1024;

/// Largest accepted shard count.
pub const MAX_SHARD_COUNT: usize = 1 << 16;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default period of the background vacuum.
pub const DEFAULT_VACUUM_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Size budget used when `max_size` is automatic and the amount of available
/// memory cannot be determined (10 GiB).
pub const FALLBACK_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Smallest page size chosen automatically.
pub const MIN_AUTO_PAGE_SIZE: usize = 4 * 1024;

/// Largest page size chosen automatically.
pub const MAX_AUTO_PAGE_SIZE: usize = 4 * 1024 * 1024;

/// Smallest page size accepted when set explicitly.
pub const MIN_PAGE_SIZE: usize = 64;

/// Automatic page size as a percentage of the per-shard budget.
pub const PAGE_SIZE_PERCENT: u64 = 10;

/// Default depth of each shard's free-page pool.
pub const DEFAULT_FREE_PAGE_POOL: usize = 4;

/// Diagnostic verbosity. Each level includes everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Verbosity {
    /// Emit nothing
    #[default]
    None = 0,
    /// Invariant violations only
    Exception = 1,
    /// Operation failures (vacuum errors)
    Error = 2,
    /// Warnings such as an exhausted budget or a slow vacuum pass
    Warning = 3,
    /// Lifecycle events
    Debug1 = 4,
    /// Vacuum pass summaries
    Debug2 = 5,
    /// Per-operation traces
    Debug3 = 6,
}

impl Verbosity {
    /// Returns true if events of `level` should be emitted.
    #[inline]
    pub fn includes(self, level: Verbosity) -> bool {
        level != Verbosity::None && self >= level
    }

    /// The `tracing` filter matching this verbosity.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::None => LevelFilter::OFF,
            Verbosity::Exception | Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Warning => LevelFilter::WARN,
            Verbosity::Debug1 => LevelFilter::INFO,
            Verbosity::Debug2 => LevelFilter::DEBUG,
            Verbosity::Debug3 => LevelFilter::TRACE,
        }
    }

    /// Parses an ordinal level in `0..=6`.
    pub fn from_level(level: i64) -> Result<Self> {
        Ok(match level {
            0 => Verbosity::None,
            1 => Verbosity::Exception,
            2 => Verbosity::Error,
            3 => Verbosity::Warning,
            4 => Verbosity::Debug1,
            5 => Verbosity::Debug2,
            6 => Verbosity::Debug3,
            other => {
                return Err(CacheError::InvalidConfig(format!(
                    "verbosity level {} is outside 0..=6",
                    other
                )))
            }
        })
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of shards, a power of two
    pub shard_count: usize,
    /// Lifetime of an entry written with [`set`](crate::CacheEngine::set),
    /// also the period of the background expiry pass
    pub ttl: Duration,
    /// Period of the background vacuum, zero disables it
    pub vacuum_interval: Duration,
    /// Maximum resident bytes across all shards, zero picks half of the
    /// available memory
    pub max_size: u64,
    /// Standard page size in bytes, zero derives it from the budget
    pub page_size: usize,
    /// Reclaimed pages each shard keeps for reuse
    pub free_page_pool: usize,
    /// Overwrite live keys on set instead of failing with `KeyExists`
    pub force_set: bool,
    /// Diagnostic verbosity
    pub verbosity: Verbosity,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            ttl: DEFAULT_TTL,
            vacuum_interval: DEFAULT_VACUUM_INTERVAL,
            max_size: 0,
            page_size: 0,
            free_page_pool: DEFAULT_FREE_PAGE_POOL,
            force_set: false,
            verbosity: Verbosity::None,
        }
    }
}

impl CacheConfig {
    /// Creates a default configuration with the given entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_vacuum_interval(mut self, interval: Duration) -> Self {
        self.vacuum_interval = interval;
        self
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_free_page_pool(mut self, pages: usize) -> Self {
        self.free_page_pool = pages;
        self
    }

    pub fn with_force_set(mut self, force_set: bool) -> Self {
        self.force_set = force_set;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Builds a configuration from the raw numbers of a binding layer.
    ///
    /// Durations are nanoseconds. A negative size or an unknown verbosity
    /// level is rejected here; the rest is checked by [`validate`](Self::validate).
    pub fn from_raw(
        shard_count: u64,
        ttl_ns: u64,
        vacuum_ns: u64,
        max_size: i64,
        force_set: bool,
        verbose_lvl: i64,
    ) -> Result<Self> {
        let max_size = u64::try_from(max_size).map_err(|_| {
            CacheError::InvalidConfig(format!("max size {} is negative", max_size))
        })?;
        let shard_count = usize::try_from(shard_count).map_err(|_| {
            CacheError::InvalidConfig(format!("shard count {} is too large", shard_count))
        })?;

        let config = Self {
            shard_count,
            ttl: Duration::from_nanos(ttl_ns),
            vacuum_interval: Duration::from_nanos(vacuum_ns),
            max_size,
            force_set,
            verbosity: Verbosity::from_level(verbose_lvl)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from `SHARDCACHE_*` environment variables.
    ///
    /// # Environment Variables
    /// - `SHARDCACHE_SHARDS` - shard count (default: 1024)
    /// - `SHARDCACHE_TTL_MS` - entry lifetime in milliseconds (default: 60000)
    /// - `SHARDCACHE_VACUUM_MS` - vacuum period in milliseconds, 0 disables (default: 600000)
    /// - `SHARDCACHE_MAX_SIZE` - size budget in bytes, 0 is automatic (default: 0)
    /// - `SHARDCACHE_PAGE_SIZE` - page size in bytes, 0 is automatic (default: 0)
    /// - `SHARDCACHE_FORCE_SET` - `true` to overwrite live keys (default: false)
    /// - `SHARDCACHE_VERBOSE` - verbosity level 0-6 (default: 0)
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shard_count: env_parse("SHARDCACHE_SHARDS").unwrap_or(defaults.shard_count),
            ttl: env_parse("SHARDCACHE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.ttl),
            vacuum_interval: env_parse("SHARDCACHE_VACUUM_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.vacuum_interval),
            max_size: env_parse("SHARDCACHE_MAX_SIZE").unwrap_or(defaults.max_size),
            page_size: env_parse("SHARDCACHE_PAGE_SIZE").unwrap_or(defaults.page_size),
            free_page_pool: defaults.free_page_pool,
            force_set: env_parse("SHARDCACHE_FORCE_SET").unwrap_or(defaults.force_set),
            verbosity: env_parse::<i64>("SHARDCACHE_VERBOSE")
                .and_then(|lvl| Verbosity::from_level(lvl).ok())
                .unwrap_or(defaults.verbosity),
        }
    }

    /// Checks the configuration without resolving automatic values.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "shard count {} is not a power of two",
                self.shard_count
            )));
        }
        if self.shard_count > MAX_SHARD_COUNT {
            return Err(CacheError::InvalidConfig(format!(
                "shard count {} exceeds maximum {}",
                self.shard_count, MAX_SHARD_COUNT
            )));
        }
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be non-zero".into()));
        }
        if self.page_size != 0 && self.page_size < MIN_PAGE_SIZE {
            return Err(CacheError::InvalidConfig(format!(
                "page size {} is below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.max_size != 0 && self.page_size as u64 > self.max_size {
            return Err(CacheError::InvalidConfig(format!(
                "page size {} exceeds max size {}",
                self.page_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Returns the size budget, probing available memory when automatic.
    pub fn resolved_max_size(&self) -> u64 {
        if self.max_size != 0 {
            return self.max_size;
        }

        let mut system = System::new();
        system.refresh_memory();
        match system.available_memory() / 2 {
            0 => FALLBACK_MAX_SIZE,
            half => half,
        }
    }

    /// Returns the page size for a given budget.
    ///
    /// Automatic sizing takes a tenth of the per-shard budget, clamped to
    /// `MIN_AUTO_PAGE_SIZE..=MAX_AUTO_PAGE_SIZE`.
    pub fn resolved_page_size(&self, max_size: u64) -> usize {
        if self.page_size != 0 {
            return self.page_size;
        }

        let per_shard = max_size / self.shard_count.max(1) as u64;
        let page = per_shard * PAGE_SIZE_PERCENT / 100;
        (page as usize).clamp(MIN_AUTO_PAGE_SIZE, MAX_AUTO_PAGE_SIZE)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
