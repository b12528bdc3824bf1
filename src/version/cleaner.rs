//! # Old Records Cleaner
//!
//! Deferred reclamation of retired records. Writers never free what they
//! supersede; they push it here with the superseding writer's timestamp,
//! and the cleaner frees it once no live snapshot predates that timestamp.
//!
//! ## Two-Stage Pipeline
//!
//! Retired *records* become purgeable once no snapshot predates their
//! retirement: they can be destroyed, unlinked, and their index entries
//! cleared. Their *space* is a separate question - an in-flight reader may
//! have resolved a raw pointer through the index just before the purge and
//! can keep dereferencing it until its snapshot closes. Purged spaces
//! therefore queue in a FIFO of batches stamped with `free_ts`, and a batch
//! reaches the arena only once `free_ts < oldest_snapshot_ts`. The FIFO is
//! monotone in `free_ts` by construction, so draining stops at the first
//! ineligible batch.
//!
//! ## Queues
//!
//! ```text
//! worker caches (per worker, spinlocked)
//!   old_data_records ──┐  always drained by a full sweep
//!   old_delete_records ┤  drained past a backlog high-water mark
//!                      v
//! global queues ──> purge ──> PendingFreeSpaceEntries ──> Arena::batch_free
//! ```
//!
//! Old-delete records prefer the worker-local fast path
//! ([`OldRecordsCleaner::try_clean_cached`]) because purging them touches
//! the hash index under its bucket lock; the backlog bound only exists so
//! an idle worker cannot pin tombstones forever.
//!
//! ## Lock Order
//!
//! Worker-cache lock -> bucket (key) lock -> link lock. A full sweep takes
//! worker caches one at a time and never holds two, so sweeps and workers
//! cannot deadlock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, trace};

use crate::config::StoreConfig;
use crate::index::{HashIndex, IndexPointer};
use crate::list::{DlList, LockTable};
use crate::memory::{Arena, SpaceEntry};
use crate::records::{Record, RecordType};
use crate::workers::WorkerToken;

use super::VersionController;

/// A superseded record of Normal status, retired by the writer whose
/// timestamp it carries.
#[derive(Debug, Clone)]
pub struct OldDataRecord {
    pub record: u64,
    pub newer_version_timestamp: u64,
}

/// A record retired through the delete path: either a tombstone (whose
/// index entry must be cleared if it is still published) or the Normal
/// record that tombstone superseded. Carries the internal key so the index
/// entry can be re-resolved under its bucket lock at purge time.
#[derive(Debug, Clone)]
pub struct OldDeleteRecord {
    pub record: u64,
    pub internal_key: Box<[u8]>,
    pub newer_version_timestamp: u64,
}

struct PendingFreeSpaceEntries {
    entries: Vec<SpaceEntry>,
    free_ts: u64,
}

#[derive(Default)]
struct WorkerCache {
    old_data_records: VecDeque<OldDataRecord>,
    old_delete_records: VecDeque<OldDeleteRecord>,
    clean_round: usize,
}

#[derive(Default)]
struct GlobalQueues {
    old_data_records: VecDeque<OldDataRecord>,
    old_delete_records: VecDeque<OldDeleteRecord>,
    pending_free_space_entries: VecDeque<PendingFreeSpaceEntries>,
}

pub struct OldRecordsCleaner {
    arena: Arc<Arena>,
    index: Arc<HashIndex>,
    link_locks: Arc<LockTable>,
    version: Arc<VersionController>,
    worker_caches: Box<[Mutex<WorkerCache>]>,
    global: Mutex<GlobalQueues>,
    last_clean_all_ts: AtomicU64,
    delete_drain_backlog: usize,
    update_snapshot_round: usize,
}

impl OldRecordsCleaner {
    pub fn new(
        arena: Arc<Arena>,
        index: Arc<HashIndex>,
        link_locks: Arc<LockTable>,
        version: Arc<VersionController>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            arena,
            index,
            link_locks,
            version,
            worker_caches: (0..config.max_workers)
                .map(|_| Mutex::new(WorkerCache::default()))
                .collect(),
            global: Mutex::new(GlobalQueues::default()),
            last_clean_all_ts: AtomicU64::new(0),
            delete_drain_backlog: config.delete_drain_backlog,
            update_snapshot_round: config.update_snapshot_round,
        }
    }

    /// Queues a superseded Normal record from `worker`'s write.
    pub fn push_data(&self, worker: &WorkerToken, record: OldDataRecord) {
        self.worker_caches[worker.id()]
            .lock()
            .old_data_records
            .push_back(record);
    }

    /// Queues a delete-path retirement from `worker`'s write.
    pub fn push_delete(&self, worker: &WorkerToken, record: OldDeleteRecord) {
        self.worker_caches[worker.id()]
            .lock()
            .old_delete_records
            .push_back(record);
    }

    /// Worker-local fast path: frees up to `limit` entries from each of the
    /// caller's two queues, oldest first, stopping at the first entry whose
    /// retirement is still visible. Refreshes the global snapshot floor
    /// once per `update_snapshot_round` calls to amortize the slot scan.
    pub fn try_clean_cached(&self, worker: &WorkerToken, limit: usize) {
        let mut cache = self.worker_caches[worker.id()].lock();
        if cache.old_data_records.is_empty() && cache.old_delete_records.is_empty() {
            return;
        }

        cache.clean_round += 1;
        if cache.clean_round % self.update_snapshot_round == 0 {
            self.version.update_oldest_snapshot();
        }

        let last_clean_all = self.last_clean_all_ts.load(Ordering::Acquire);
        for _ in 0..limit {
            let eligible = matches!(
                cache.old_delete_records.front(),
                Some(rec) if rec.newer_version_timestamp < last_clean_all
            );
            if !eligible {
                break;
            }
            if let Some(rec) = cache.old_delete_records.pop_front() {
                let space = self.purge_old_delete_record(&rec);
                self.arena.free(space);
            }
        }

        let oldest = self.version.oldest_snapshot_ts();
        for _ in 0..limit {
            let eligible = matches!(
                cache.old_data_records.front(),
                Some(rec) if rec.newer_version_timestamp < oldest
            );
            if !eligible {
                break;
            }
            if let Some(rec) = cache.old_data_records.pop_front() {
                let space = self.purge_old_data_record(rec.record);
                self.arena.free(space);
            }
        }
    }

    /// Full background sweep: drains worker caches, purges every eligible
    /// queued record, stages purged delete-record spaces behind the second
    /// timestamp gate, and batch-frees whatever has cleared it.
    pub fn try_clean_all(&self) {
        let mut global = self.global.lock();
        let ts = self.version.new_timestamp();
        self.version.update_oldest_snapshot();
        let oldest = self.version.oldest_snapshot_ts();

        // Fetch worker-cached retirements, one cache at a time.
        for cache in self.worker_caches.iter() {
            let mut cache = cache.lock();
            if !cache.old_data_records.is_empty() {
                let drained = std::mem::take(&mut cache.old_data_records);
                global.old_data_records.extend(drained);
            }
            if cache.old_delete_records.len() > self.delete_drain_backlog {
                let drained = std::mem::take(&mut cache.old_delete_records);
                global.old_delete_records.extend(drained);
            }
        }

        // Free-able data records; the rest wait for the next pass.
        let mut space_to_free: SmallVec<[SpaceEntry; 16]> = SmallVec::new();
        let mut data_referred = VecDeque::new();
        for rec in std::mem::take(&mut global.old_data_records) {
            if rec.newer_version_timestamp <= oldest {
                space_to_free.push(self.purge_old_data_record(rec.record));
            } else {
                data_referred.push_back(rec);
            }
        }

        // Free-able delete records; their spaces take the second gate.
        let mut space_pending = Vec::new();
        let mut delete_referred = VecDeque::new();
        for rec in std::mem::take(&mut global.old_delete_records) {
            if rec.newer_version_timestamp <= oldest {
                space_pending.push(self.purge_old_delete_record(&rec));
            } else {
                delete_referred.push_back(rec);
            }
        }

        self.last_clean_all_ts.store(ts, Ordering::Release);

        let purged_data = space_to_free.len();
        let purged_delete = space_pending.len();

        if !space_pending.is_empty() {
            global.pending_free_space_entries.push_back(PendingFreeSpaceEntries {
                entries: space_pending,
                free_ts: self.version.new_timestamp(),
            });
        }

        // Drain the head of the FIFO; it is monotone in free_ts, so the
        // first ineligible batch ends the drain.
        let mut freed_spaces = 0usize;
        while let Some(front) = global.pending_free_space_entries.front() {
            if front.free_ts < oldest {
                freed_spaces += front.entries.len();
                self.arena.batch_free(&front.entries);
                global.pending_free_space_entries.pop_front();
            } else {
                break;
            }
        }

        if !space_to_free.is_empty() {
            self.arena.batch_free(&space_to_free);
        }

        global.old_data_records = data_referred;
        global.old_delete_records = delete_referred;

        trace!(
            ts,
            oldest,
            purged_data,
            purged_delete,
            freed_spaces,
            delayed_data = global.old_data_records.len(),
            delayed_delete = global.old_delete_records.len(),
            "old records sweep"
        );
    }

    /// Destroys a superseded data record and returns its space. Only
    /// Normal-status element or header records ride the data queue; anything
    /// else is a storage-format violation with no safe continuation.
    fn purge_old_data_record(&self, record: u64) -> SpaceEntry {
        let rec = Record::from_arena(&self.arena, record);
        match rec.record_type() {
            RecordType::HashElem | RecordType::HashHeader => {
                let space = rec.space(&self.arena);
                rec.destroy();
                space
            }
            other => {
                error!(?other, record, "non-data record in old-data queue");
                std::process::abort();
            }
        }
    }

    /// Purges a delete-path retirement. If the record is a tombstone the
    /// index still publishes, splices it out of its list and clears the
    /// entry (double-checked: the cheap probe first, then re-verified under
    /// the bucket lock). Returns the record's space for the pending queue.
    fn purge_old_delete_record(&self, old: &OldDeleteRecord) -> SpaceEntry {
        let rec = Record::from_arena(&self.arena, old.record);
        match rec.record_type() {
            RecordType::HashElem => {
                let published = IndexPointer::Record(old.record);
                if self.index.lookup(&old.internal_key).entry.map(|e| e.pointer)
                    == Some(published)
                {
                    let _bucket = self.index.acquire_lock(&old.internal_key);
                    let still = self.index.lookup(&old.internal_key).entry.map(|e| e.pointer)
                        == Some(published);
                    if still {
                        DlList::remove_at(&self.arena, &self.link_locks, old.record);
                        self.index.erase_if(&old.internal_key, |e| e.pointer == published);
                    }
                }
                let space = rec.space(&self.arena);
                rec.destroy();
                space
            }
            other => {
                error!(?other, record = old.record, "non-element record in old-delete queue");
                std::process::abort();
            }
        }
    }

    /// Retirements currently queued (worker caches plus global), for
    /// diagnostics and tests.
    pub fn queued_data_records(&self) -> usize {
        let cached: usize = self
            .worker_caches
            .iter()
            .map(|c| c.lock().old_data_records.len())
            .sum();
        cached + self.global.lock().old_data_records.len()
    }

    pub fn queued_delete_records(&self) -> usize {
        let cached: usize = self
            .worker_caches
            .iter()
            .map(|c| c.lock().old_delete_records.len())
            .sum();
        cached + self.global.lock().old_delete_records.len()
    }

    /// Purged space batches still waiting behind the second gate.
    pub fn pending_free_batches(&self) -> usize {
        self.global.lock().pending_free_space_entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NULL_OFFSET;
    use crate::records::{RecordStatus, NO_EXPIRE};
    use crate::workers::WorkerRegistry;

    struct Rig {
        arena: Arc<Arena>,
        index: Arc<HashIndex>,
        version: Arc<VersionController>,
        cleaner: OldRecordsCleaner,
        registry: Arc<WorkerRegistry>,
    }

    fn rig() -> Rig {
        let config = StoreConfig {
            arena_capacity: 1 << 16,
            ..Default::default()
        };
        let arena = Arc::new(Arena::new(config.arena_capacity).unwrap());
        let index = Arc::new(HashIndex::new(config.index_shards, config.key_lock_stripes));
        let locks = Arc::new(LockTable::new(config.link_lock_stripes));
        let version = Arc::new(VersionController::new(config.max_snapshots));
        let cleaner = OldRecordsCleaner::new(
            Arc::clone(&arena),
            Arc::clone(&index),
            Arc::clone(&locks),
            Arc::clone(&version),
            &config,
        );
        Rig {
            arena,
            index,
            version,
            cleaner,
            registry: Arc::new(WorkerRegistry::new(config.max_workers)),
        }
    }

    fn orphan_record(rig: &Rig, ts: u64, status: RecordStatus, key: &[u8]) -> u64 {
        let space = rig.arena.allocate(Record::record_size_for(key, b"v"));
        let off = space.offset;
        // SAFETY: fresh exclusive span; self-linked so list ops see a
        // consistent (unlinked) record.
        unsafe {
            Record::construct(
                rig.arena.offset2addr_checked(off),
                space.size,
                ts,
                RecordType::HashElem,
                status,
                NULL_OFFSET,
                off,
                off,
                key,
                b"v",
                NO_EXPIRE,
            );
        }
        off
    }

    #[test]
    fn data_record_frees_after_snapshot_floor_passes() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Normal, b"k");
        rig.version.observe(20);

        let snap = rig.version.hold_snapshot().unwrap();
        assert_eq!(snap.ts(), 20);
        rig.version.observe(30);

        rig.cleaner.push_data(
            &worker,
            OldDataRecord {
                record: rec,
                newer_version_timestamp: 30,
            },
        );

        // snapshot at 20 still pins the retirement at 30
        rig.cleaner.try_clean_all();
        assert_eq!(rig.cleaner.queued_data_records(), 1);

        drop(snap);
        rig.cleaner.try_clean_all();
        assert_eq!(rig.cleaner.queued_data_records(), 0);
        assert_eq!(Record::from_arena(&rig.arena, rec).record_type(), RecordType::Empty);
    }

    #[test]
    fn delete_record_space_waits_behind_second_gate() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Outdated, b"k");
        rig.version.observe(30);

        let allocated_before = rig.arena.bytes_allocated();
        rig.cleaner.push_delete(
            &worker,
            OldDeleteRecord {
                record: rec,
                internal_key: b"k".to_vec().into_boxed_slice(),
                newer_version_timestamp: 30,
            },
        );

        rig.cleaner.try_clean_all();
        // purged, but space still staged
        assert_eq!(rig.cleaner.queued_delete_records(), 0);
        assert_eq!(rig.cleaner.pending_free_batches(), 1);
        assert_eq!(rig.arena.bytes_allocated(), allocated_before);

        rig.cleaner.try_clean_all();
        assert_eq!(rig.cleaner.pending_free_batches(), 0);
        assert!(rig.arena.bytes_allocated() < allocated_before);
    }

    #[test]
    fn tombstone_purge_clears_published_entry() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Outdated, b"k");

        let lookup = rig.index.lookup(b"k");
        rig.index.insert(
            &lookup,
            RecordType::HashElem,
            RecordStatus::Outdated,
            IndexPointer::Record(rec),
        );
        rig.version.observe(30);

        rig.cleaner.push_delete(
            &worker,
            OldDeleteRecord {
                record: rec,
                internal_key: b"k".to_vec().into_boxed_slice(),
                newer_version_timestamp: 30,
            },
        );
        rig.cleaner.try_clean_all();
        assert!(!rig.index.lookup(b"k").is_found());
    }

    #[test]
    fn tombstone_purge_leaves_repointed_entry_alone() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Outdated, b"k");
        let newer = orphan_record(&rig, 40, RecordStatus::Normal, b"k");

        let lookup = rig.index.lookup(b"k");
        rig.index.insert(
            &lookup,
            RecordType::HashElem,
            RecordStatus::Normal,
            IndexPointer::Record(newer),
        );
        rig.version.observe(50);

        rig.cleaner.push_delete(
            &worker,
            OldDeleteRecord {
                record: rec,
                internal_key: b"k".to_vec().into_boxed_slice(),
                newer_version_timestamp: 41,
            },
        );
        rig.cleaner.try_clean_all();

        let entry = rig.index.lookup(b"k").entry.unwrap();
        assert_eq!(entry.pointer, IndexPointer::Record(newer));
        // the tombstone itself was still destroyed and staged
        assert_eq!(Record::from_arena(&rig.arena, rec).record_type(), RecordType::Empty);
    }

    #[test]
    fn worker_fast_path_needs_a_prior_full_sweep() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Outdated, b"k");
        rig.version.observe(30);

        rig.cleaner.push_delete(
            &worker,
            OldDeleteRecord {
                record: rec,
                internal_key: b"k".to_vec().into_boxed_slice(),
                newer_version_timestamp: 30,
            },
        );

        // no full sweep yet: last_clean_all_ts is 0, nothing qualifies
        rig.cleaner.try_clean_cached(&worker, 16);
        assert_eq!(rig.cleaner.queued_delete_records(), 1);

        // a sweep on an empty global queue advances last_clean_all_ts
        // (the worker backlog stays below the drain mark)
        rig.cleaner.try_clean_all();
        assert_eq!(rig.cleaner.queued_delete_records(), 1);

        rig.cleaner.try_clean_cached(&worker, 16);
        assert_eq!(rig.cleaner.queued_delete_records(), 0);
    }

    #[test]
    fn data_records_always_drain_to_global_on_sweep() {
        let rig = rig();
        let worker = rig.registry.register().unwrap();
        rig.version.observe(5);
        let snap = rig.version.hold_snapshot().unwrap();
        let rec = orphan_record(&rig, 10, RecordStatus::Normal, b"k");
        rig.version.observe(30);

        rig.cleaner.push_data(
            &worker,
            OldDataRecord {
                record: rec,
                newer_version_timestamp: 30,
            },
        );
        rig.cleaner.try_clean_all();
        // pinned by the snapshot, but now owned by the global queue
        drop(worker);
        assert_eq!(rig.cleaner.queued_data_records(), 1);
        drop(snap);
        rig.cleaner.try_clean_all();
        assert_eq!(rig.cleaner.queued_data_records(), 0);
    }
}
