//! Shard Router
//!
//! Keys are routed by hashing them with a fixed-seed hasher and masking the
//! result with `shard_count - 1`. The seeds are constant, so a key always maps
//! to the same shard within a build.

use std::sync::Arc;

use ahash::RandomState;

use crate::config::Verbosity;
use crate::error::{CacheError, Result};
use crate::storage::budget::SizeBudget;
use crate::storage::shard::Shard;

/// Owns the shards and maps keys onto them.
#[derive(Debug)]
pub struct ShardRouter {
    shards: Box<[Shard]>,
    mask: u64,
    hasher: RandomState,
}

impl ShardRouter {
    /// Builds `shard_count` empty shards. `shard_count` must be a power of two.
    pub fn new(
        shard_count: usize,
        page_size: usize,
        free_page_pool: usize,
        budget: Arc<SizeBudget>,
        verbosity: Verbosity,
    ) -> Result<Self> {
        if shard_count == 0 || !shard_count.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "shard count {} is not a power of two",
                shard_count
            )));
        }

        let shards = (0..shard_count)
            .map(|id| {
                Shard::new(
                    id,
                    page_size,
                    free_page_pool,
                    Arc::clone(&budget),
                    verbosity,
                )
            })
            .collect();

        Ok(Self {
            shards,
            mask: (shard_count as u64) - 1,
            hasher: RandomState::with_seeds(
                0x9e37_79b9_7f4a_7c15,
                0xc2b2_ae3d_27d4_eb4f,
                0x1656_67b1_9e37_79f9,
                0x27d4_eb2f_1656_67c5,
            ),
        })
    }

    /// Index of the shard owning `key`.
    #[inline]
    pub fn route(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) & self.mask) as usize
    }

    /// The shard owning `key`.
    pub fn shard(&self, key: &[u8]) -> Result<&Shard> {
        self.shards.get(self.route(key)).ok_or(CacheError::NoShard)
    }

    pub fn get(&self, index: usize) -> Result<&Shard> {
        self.shards.get(index).ok_or(CacheError::NoShard)
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
