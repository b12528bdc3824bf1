//! # hivekv Configuration Module
//!
//! This module centralizes all configuration constants for hivekv. Constants
//! are grouped by their functional area and interdependencies are documented
//! and enforced through compile-time assertions where possible.
//!
//! Runtime-tunable knobs live in [`StoreConfig`], validated once when a
//! store is opened.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;

use eyre::{ensure, Result};

/// Tunables for one store instance. `Default` gives a configuration suitable
/// for tests and small deployments; production embedders size
/// `arena_capacity` to their working set.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total byte capacity of the record arena. Rounded up to the record
    /// alignment on open.
    pub arena_capacity: u64,
    /// Number of hash-index shards. Must be a power of two.
    pub index_shards: usize,
    /// Stripes in the per-key write-lock table. Must be a power of two.
    pub key_lock_stripes: usize,
    /// Stripes in the record link-lock table. Must be a power of two.
    pub link_lock_stripes: usize,
    /// Maximum concurrently registered workers.
    pub max_workers: usize,
    /// Maximum concurrently held snapshots.
    pub max_snapshots: usize,
    /// Backlog at which a worker's cached old-delete records are drained
    /// into the cleaner's global queue by a full sweep. Old-data records are
    /// always drained; delete records prefer the worker-local fast path
    /// because clearing their index entries under the bucket lock is the
    /// expensive part.
    pub delete_drain_backlog: usize,
    /// Space entries batched during collection teardown before handing the
    /// batch to the arena.
    pub max_cached_old_records: usize,
    /// Worker-local cleaning refreshes the oldest-snapshot floor once per
    /// this many calls.
    pub update_snapshot_round: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            index_shards: DEFAULT_INDEX_SHARDS,
            key_lock_stripes: DEFAULT_KEY_LOCK_STRIPES,
            link_lock_stripes: DEFAULT_LINK_LOCK_STRIPES,
            max_workers: DEFAULT_MAX_WORKERS,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            delete_drain_backlog: DEFAULT_DELETE_DRAIN_BACKLOG,
            max_cached_old_records: MAX_CACHED_OLD_RECORDS,
            update_snapshot_round: UPDATE_SNAPSHOT_ROUND,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.arena_capacity >= MIN_ARENA_CAPACITY,
            "arena_capacity {} below minimum {}",
            self.arena_capacity,
            MIN_ARENA_CAPACITY
        );
        ensure!(
            self.index_shards.is_power_of_two(),
            "index_shards must be a power of two, got {}",
            self.index_shards
        );
        ensure!(
            self.key_lock_stripes.is_power_of_two(),
            "key_lock_stripes must be a power of two, got {}",
            self.key_lock_stripes
        );
        ensure!(
            self.link_lock_stripes.is_power_of_two(),
            "link_lock_stripes must be a power of two, got {}",
            self.link_lock_stripes
        );
        ensure!(self.max_workers > 0, "max_workers must be non-zero");
        ensure!(self.max_snapshots > 0, "max_snapshots must be non-zero");
        ensure!(
            self.update_snapshot_round > 0,
            "update_snapshot_round must be non-zero"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_arena() {
        let cfg = StoreConfig {
            arena_capacity: 64,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let cfg = StoreConfig {
            index_shards: 48,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = StoreConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
