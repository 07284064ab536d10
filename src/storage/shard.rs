//! Shard
//!
//! A shard owns one [`KeyIndex`], one [`PageArena`] and the lock that
//! serializes them. Shards never share state with each other except through
//! the global [`SizeBudget`].
//!
//! ## Locking
//!
//! Gets of live entries take the read side of the lock, so hits on the same
//! shard proceed in parallel. Anything that mutates (set, delete, lazy
//! expiry, the expiry sweep, vacuum, close) takes the write side. A get that finds an expired
//! entry drops its read guard and re-checks under the write guard before
//! removing it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::config::Verbosity;
use crate::error::{CacheError, Result};
use crate::storage::arena::{PageArena, Span};
use crate::storage::budget::SizeBudget;
use crate::storage::index::{EntryDescriptor, KeyIndex};

/// Consecutive failed vacuum passes after which a shard is degraded.
pub const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Outcome of one vacuum pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Expired entries removed
    pub expired: usize,
    /// Pages reclaimed, whether their buffers were pooled or freed
    pub pages_reclaimed: usize,
    /// Bytes returned to the size budget
    pub bytes_released: u64,
    /// Index entries dropped because their bytes were missing
    pub inconsistencies: usize,
}

impl VacuumReport {
    pub fn merge(&mut self, other: &VacuumReport) {
        self.expired += other.expired;
        self.pages_reclaimed += other.pages_reclaimed;
        self.bytes_released += other.bytes_released;
        self.inconsistencies += other.inconsistencies;
    }
}

/// Point-in-time view of a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub entries: usize,
    pub pages: usize,
    pub pooled_pages: usize,
    pub resident_bytes: u64,
    pub live_bytes: u64,
    pub expired: u64,
    pub degraded: bool,
}

#[derive(Debug)]
struct ShardState {
    index: KeyIndex,
    arena: PageArena,
    closed: bool,
}

impl ShardState {
    /// Drops expired entries and marks their bytes dead. Returns the first
    /// release failure.
    fn drain_expired(&mut self, now: Instant, report: &mut VacuumReport) -> Option<CacheError> {
        let mut fault = None;
        for desc in self.index.drain_expired(now) {
            report.expired += 1;
            if let Err(err) = self.arena.release(desc.span) {
                report.inconsistencies += 1;
                fault.get_or_insert(err);
            }
        }
        fault
    }

    /// Reclaims every page without live entries, the active one included.
    fn reclaim_empty_pages(&mut self, report: &mut VacuumReport) -> Option<CacheError> {
        let mut fault = None;
        for page in self.arena.reclaimable() {
            match self.arena.reclaim(page) {
                Ok(bytes) => {
                    report.pages_reclaimed += 1;
                    report.bytes_released += bytes;
                }
                Err(err) => {
                    report.inconsistencies += 1;
                    fault.get_or_insert(err);
                }
            }
        }
        fault
    }
}

/// One partition of the key space.
#[derive(Debug)]
pub struct Shard {
    id: usize,
    state: RwLock<ShardState>,
    degraded: AtomicBool,
    vacuum_failures: AtomicU32,
    expired: AtomicU64,
    verbosity: Verbosity,
}

impl Shard {
    pub fn new(
        id: usize,
        page_size: usize,
        free_page_pool: usize,
        budget: Arc<SizeBudget>,
        verbosity: Verbosity,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(ShardState {
                index: KeyIndex::new(),
                arena: PageArena::new(page_size, free_page_pool, budget),
                closed: false,
            }),
            degraded: AtomicBool::new(false),
            vacuum_failures: AtomicU32::new(0),
            expired: AtomicU64::new(0),
            verbosity,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Stores `data` under `key` with the given lifetime.
    ///
    /// An expired entry under the same key is removed first and never blocks
    /// the write. A live one fails with `KeyExists` unless `overwrite` is set.
    /// If storage cannot be allocated the index, including any prior value,
    /// is left as it was.
    pub fn set(&self, key: &[u8], data: &[u8], ttl: Duration, overwrite: bool) -> Result<()> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }

        let now = Instant::now();
        if let Some(prior) = state.index.lookup(key).copied() {
            if prior.is_expired_at(now) {
                state.index.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.release_span(&mut state.arena, prior.span)?;
            } else if !overwrite {
                if self.verbosity.includes(Verbosity::Debug3) {
                    trace!(shard = self.id, key = %String::from_utf8_lossy(key), "key exists");
                }
                return Err(CacheError::KeyExists);
            }
        }

        let span = match state.arena.allocate(data.len()) {
            Ok(span) => span,
            Err(err) => {
                if self.verbosity.includes(Verbosity::Warning) {
                    warn!(shard = self.id, bytes = data.len(), error = %err, "allocation failed");
                }
                return Err(err);
            }
        };
        if let Err(err) = state.arena.write(span, data) {
            let err = self.fault(err);
            self.release_span(&mut state.arena, span)?;
            return Err(err);
        }

        let desc = EntryDescriptor::new(span, now, ttl);
        if let Some(prior) = state.index.insert(Bytes::copy_from_slice(key), desc, true)? {
            self.release_span(&mut state.arena, prior.span)?;
        }

        if self.verbosity.includes(Verbosity::Debug3) {
            trace!(
                shard = self.id,
                key = %String::from_utf8_lossy(key),
                bytes = data.len(),
                page = span.page.get(),
                offset = span.offset,
                "set"
            );
        }
        Ok(())
    }

    /// Copies the value of `key` into `buf` and returns its length.
    ///
    /// Fails with `BufLenLow` (reporting the stored length) when `buf` is too
    /// short; the entry is left untouched.
    pub fn get(&self, key: &[u8], buf: &mut [u8]) -> Result<usize> {
        self.with_entry(key, |bytes| {
            if bytes.len() > buf.len() {
                return Err(CacheError::BufLenLow {
                    required: bytes.len(),
                    capacity: buf.len(),
                });
            }
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        })
    }

    /// Returns an exact-size copy of the value of `key`.
    pub fn get_owned(&self, key: &[u8]) -> Result<Bytes> {
        self.with_entry(key, |bytes| Ok(Bytes::copy_from_slice(bytes)))
    }

    /// Returns the stored length of the value of `key`.
    pub fn entry_len(&self, key: &[u8]) -> Result<usize> {
        self.with_entry(key, |bytes| Ok(bytes.len()))
    }

    /// Runs `f` over the live bytes of `key`, expiring the entry lazily.
    fn with_entry<T, F>(&self, key: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        {
            let state = self.read_state()?;
            if state.closed {
                return Err(CacheError::CacheClosed);
            }
            match state.index.lookup(key) {
                None => return Err(CacheError::KeyNotFound),
                Some(desc) if !desc.is_expired_at(Instant::now()) => {
                    let bytes = state.arena.read(desc.span).map_err(|e| self.fault(e))?;
                    return f(bytes);
                }
                Some(_) => {}
            }
        }

        let mut guard = self.write_state()?;
        let state = &mut *guard;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }
        match state.index.lookup(key).copied() {
            None => Err(CacheError::KeyNotFound),
            Some(desc) if desc.is_expired_at(Instant::now()) => {
                state.index.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.release_span(&mut state.arena, desc.span)?;
                if self.verbosity.includes(Verbosity::Debug3) {
                    trace!(shard = self.id, key = %String::from_utf8_lossy(key), "lazily expired");
                }
                Err(CacheError::KeyExpired)
            }
            // rewritten between the two lock acquisitions
            Some(desc) => {
                let bytes = state.arena.read(desc.span).map_err(|e| self.fault(e))?;
                f(bytes)
            }
        }
    }

    /// Removes `key`. Returns true if an entry was removed.
    ///
    /// The bytes become dead in place; the page is only reclaimed by vacuum.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }

        match state.index.remove(key) {
            Some(desc) => {
                self.release_span(&mut state.arena, desc.span)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes expired entries and reclaims the pages they leave empty.
    ///
    /// This is the light pass run on the ttl cadence. It skips the orphan
    /// scan, and a release failure is treated like a foreground fault.
    pub fn expire(&self) -> Result<VacuumReport> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }

        let mut report = VacuumReport::default();
        let drained = state.drain_expired(Instant::now(), &mut report);
        self.expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        if let Some(err) = drained.or_else(|| state.reclaim_empty_pages(&mut report)) {
            return Err(self.fault(err));
        }
        drop(guard);

        if self.verbosity.includes(Verbosity::Debug2) && report.expired > 0 {
            debug!(
                shard = self.id,
                expired = report.expired,
                pages = report.pages_reclaimed,
                "expired entries swept"
            );
        }
        Ok(report)
    }

    /// Removes expired entries and reclaims empty pages.
    ///
    /// Descriptors whose bytes cannot be found are dropped from the index and
    /// the pass reports `Internal` once it has finished. Consecutive failing
    /// passes degrade the shard.
    pub fn vacuum(&self) -> Result<VacuumReport> {
        let mut guard = self.write_state()?;
        let state = &mut *guard;
        if state.closed {
            return Err(CacheError::CacheClosed);
        }

        let mut report = VacuumReport::default();
        let mut fault = state.drain_expired(Instant::now(), &mut report);
        self.expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);

        let arena = &state.arena;
        let orphans = state.index.drain_where(|desc| arena.read(desc.span).is_err());
        for (key, desc) in orphans {
            report.inconsistencies += 1;
            fault.get_or_insert_with(|| {
                CacheError::Internal(format!(
                    "key {:?} references missing bytes at page {} offset {}",
                    String::from_utf8_lossy(&key),
                    desc.span.page.get(),
                    desc.span.offset
                ))
            });
        }

        if let Some(err) = state.reclaim_empty_pages(&mut report) {
            fault.get_or_insert(err);
        }
        drop(guard);

        match fault {
            None => {
                self.vacuum_failures.store(0, Ordering::Relaxed);
                if self.verbosity.includes(Verbosity::Debug2) && report != VacuumReport::default() {
                    debug!(
                        shard = self.id,
                        expired = report.expired,
                        pages = report.pages_reclaimed,
                        bytes = report.bytes_released,
                        "vacuumed"
                    );
                }
                Ok(report)
            }
            Some(err) => {
                let failures = self.vacuum_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if self.verbosity.includes(Verbosity::Exception) {
                    error!(
                        shard = self.id,
                        failures,
                        inconsistencies = report.inconsistencies,
                        error = %err,
                        "vacuum found inconsistent state"
                    );
                }
                if failures >= DEGRADE_AFTER_FAILURES {
                    self.mark_degraded();
                }
                Err(err)
            }
        }
    }

    /// Releases all storage. Every later call fails with `CacheClosed`.
    ///
    /// Returns the bytes handed back to the budget.
    pub fn close(&self) -> u64 {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.index.clear();
        state.arena.clear()
    }

    pub fn stats(&self) -> Result<ShardStats> {
        let state = self.read_state()?;
        Ok(ShardStats {
            entries: state.index.len(),
            pages: state.arena.page_count(),
            pooled_pages: state.arena.pooled_pages(),
            resident_bytes: state.arena.resident_bytes(),
            live_bytes: state.arena.live_bytes(),
            expired: self.expired.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        })
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Clears the degraded flag and the failure streak.
    pub fn reset(&self) {
        self.vacuum_failures.store(0, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Release);
    }

    pub(crate) fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel)
            && self.verbosity.includes(Verbosity::Warning)
        {
            warn!(shard = self.id, "shard marked degraded, vacuum suspended");
        }
    }

    /// Marks the bytes of `span` dead. A stale span is a fault.
    fn release_span(&self, arena: &mut PageArena, span: Span) -> Result<()> {
        arena.release(span).map_err(|e| self.fault(e))
    }

    /// Records an invariant violation seen by a foreground call.
    fn fault(&self, err: CacheError) -> CacheError {
        if self.verbosity.includes(Verbosity::Exception) {
            error!(shard = self.id, error = %err, "index/arena inconsistency");
        }
        self.mark_degraded();
        err
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, ShardState>> {
        self.state.read().map_err(|_| self.poisoned())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, ShardState>> {
        self.state.write().map_err(|_| self.poisoned())
    }

    fn poisoned(&self) -> CacheError {
        self.fault(CacheError::Internal(format!(
            "shard {} lock poisoned",
            self.id
        )))
    }
}
