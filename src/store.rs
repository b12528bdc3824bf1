//! # Store
//!
//! Wires the shared services one engine instance needs - arena, hash
//! index, link locks, version controller, cleaner, worker registry - and
//! hands out collections bound to them. The store is deliberately thin:
//! all interesting behavior lives in the components it constructs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::Result;

use crate::collection::HashList;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::index::HashIndex;
use crate::list::LockTable;
use crate::memory::Arena;
use crate::version::{OldRecordsCleaner, Snapshot, VersionController};
use crate::workers::{WorkerRegistry, WorkerToken};

pub struct Store {
    arena: Arc<Arena>,
    index: Arc<HashIndex>,
    link_locks: Arc<LockTable>,
    version: Arc<VersionController>,
    cleaner: Arc<OldRecordsCleaner>,
    workers: Arc<WorkerRegistry>,
    next_collection_id: AtomicU64,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Store> {
        config.validate()?;
        let arena = Arc::new(Arena::new(config.arena_capacity)?);
        let index = Arc::new(HashIndex::new(
            config.index_shards,
            config.key_lock_stripes,
        ));
        let link_locks = Arc::new(LockTable::new(config.link_lock_stripes));
        let version = Arc::new(VersionController::new(config.max_snapshots));
        let cleaner = Arc::new(OldRecordsCleaner::new(
            Arc::clone(&arena),
            Arc::clone(&index),
            Arc::clone(&link_locks),
            Arc::clone(&version),
            &config,
        ));
        Ok(Store {
            arena,
            index,
            link_locks,
            version,
            cleaner,
            workers: Arc::new(WorkerRegistry::new(config.max_workers)),
            next_collection_id: AtomicU64::new(1),
        })
    }

    /// Creates a collection with the next free id, stamped at the current
    /// clock.
    pub fn create_collection(&self, name: &[u8]) -> Result<Arc<HashList>, StoreError> {
        let id = self.next_collection_id.fetch_add(1, Ordering::SeqCst);
        self.create_collection_at(name, id, self.version.new_timestamp())
    }

    /// Creates a collection with an explicit id and creation timestamp,
    /// for embedders that manage both themselves.
    pub fn create_collection_at(
        &self,
        name: &[u8],
        id: u64,
        ts: u64,
    ) -> Result<Arc<HashList>, StoreError> {
        HashList::create(
            name,
            id,
            ts,
            Arc::clone(&self.arena),
            Arc::clone(&self.index),
            Arc::clone(&self.link_locks),
            Arc::clone(&self.version),
            Arc::clone(&self.cleaner),
        )
        .map(Arc::new)
    }

    pub fn register_worker(&self) -> Result<WorkerToken> {
        self.workers.register()
    }

    pub fn new_timestamp(&self) -> u64 {
        self.version.new_timestamp()
    }

    pub fn hold_snapshot(&self) -> Result<Snapshot<'_>> {
        self.version.hold_snapshot()
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn version(&self) -> &VersionController {
        &self.version
    }

    pub fn cleaner(&self) -> &OldRecordsCleaner {
        &self.cleaner
    }
}
