//! Global size accounting shared by every shard.
//!
//! The budget is one atomic counter. Shards reserve page capacity with a
//! compare-and-swap loop and release it when pages are freed, so the check
//! never serializes unrelated shards.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CacheError, Result};

/// Upper bound on resident bytes across all shards.
#[derive(Debug)]
pub struct SizeBudget {
    max: u64,
    used: AtomicU64,
}

impl SizeBudget {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: AtomicU64::new(0),
        }
    }

    /// Reserves `bytes`, failing with `NoSpace` if the total would exceed the
    /// maximum. Nothing is reserved on failure.
    pub fn try_reserve(&self, bytes: u64) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.max)
            })
            .map(|_| ())
            .map_err(|used| CacheError::NoSpace {
                requested: bytes,
                available: self.max.saturating_sub(used),
            })
    }

    /// Returns `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "budget released more than reserved");
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.used())
    }
}
