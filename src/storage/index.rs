//! Key Index
//!
//! Maps keys to [`EntryDescriptor`]s. The index owns the keys; the bytes of
//! each value live in the shard's [`PageArena`](crate::storage::arena::PageArena)
//! at the descriptor's span.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{CacheError, Result};
use crate::storage::arena::Span;

/// Far-future fallback for TTLs that overflow `Instant`.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Location and lifetime of one stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub span: Span,
    pub inserted_at: Instant,
    pub expires_at: Instant,
}

impl EntryDescriptor {
    pub fn new(span: Span, now: Instant, ttl: Duration) -> Self {
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(MAX_TTL))
            .unwrap_or(now);
        Self {
            span,
            inserted_at: now,
            expires_at,
        }
    }

    /// An entry expires once `now` is past its deadline.
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.span.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    /// Remaining lifetime, zero once expired.
    pub fn ttl_remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Per-shard key to descriptor map.
#[derive(Debug, Default)]
pub struct KeyIndex {
    entries: HashMap<Bytes, EntryDescriptor>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor.
    ///
    /// An existing key fails with `KeyExists` unless `overwrite` is set, in
    /// which case the prior descriptor is returned so its bytes can be
    /// released.
    pub fn insert(
        &mut self,
        key: Bytes,
        desc: EntryDescriptor,
        overwrite: bool,
    ) -> Result<Option<EntryDescriptor>> {
        if !overwrite && self.entries.contains_key(&key) {
            return Err(CacheError::KeyExists);
        }
        Ok(self.entries.insert(key, desc))
    }

    #[inline]
    pub fn lookup(&self, key: &[u8]) -> Option<&EntryDescriptor> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<EntryDescriptor> {
        self.entries.remove(key)
    }

    pub fn scan(&self) -> impl Iterator<Item = (&Bytes, &EntryDescriptor)> {
        self.entries.iter()
    }

    /// Removes every entry expired at `now` and returns their descriptors.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<EntryDescriptor> {
        let mut expired = Vec::new();
        self.entries.retain(|_, desc| {
            if desc.is_expired_at(now) {
                expired.push(*desc);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Removes and returns every entry matching `reject`.
    pub fn drain_where<F>(&mut self, mut reject: F) -> Vec<(Bytes, EntryDescriptor)>
    where
        F: FnMut(&EntryDescriptor) -> bool,
    {
        let doomed: Vec<Bytes> = self
            .entries
            .iter()
            .filter(|(_, desc)| reject(desc))
            .map(|(key, _)| key.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|desc| (key, desc)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
