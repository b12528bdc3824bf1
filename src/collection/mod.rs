//! # Hash Collection Façade
//!
//! `HashList` is one named hash collection: an unordered mapping from
//! byte-string sub-keys to byte-string values, stored as records on a
//! circular doubly-linked list and published through the hash index.
//!
//! ## Keys
//!
//! Each element record stores the *internal key*: the collection's 8-byte
//! little-endian id prefixed to the user sub-key. The header record is
//! keyed by the collection name and its value encodes the collection id.
//! Prefixing keeps sub-keys of different collections distinct in the
//! shared index.
//!
//! ## Write Path
//!
//! Writes are split into two phases for batching and failure symmetry:
//!
//! 1. [`HashList::prepare_write`] resolves the index lookup, decides
//!    whether the operation needs space (tombstoning a tombstone or a
//!    missing key does not), and reserves it. A failed prepare has no
//!    observable effect.
//! 2. [`HashList::write`] constructs the record, splices it (replacing the
//!    existing record in place, or at a uniformly random end of the list
//!    for a fresh key), republishes the index, adjusts the size counter,
//!    and hands the superseded record to the cleaner.
//!
//! Both phases expect the sub-key's bucket lock
//! ([`crate::index::HashIndex::acquire_lock`]) to be held; the one-shot
//! helpers (`put`, `delete`, `modify`) acquire it themselves.
//!
//! ## Retirement Rules
//!
//! - A Put superseding a Normal record retires it as an `OldDataRecord`.
//! - A Delete retires the superseded Normal record *and* the freshly
//!   written tombstone as `OldDeleteRecord`s: the tombstone's entry must
//!   eventually be cleared from the index, and both spaces take the
//!   pending-batch gate because readers may race the index repoint.
//! - A Put superseding a tombstone retires nothing extra; that tombstone
//!   already rides the delete queue since the Delete that wrote it.
//!
//! ## Reads
//!
//! `get` is lock-free: probe the index, reject tombstoned entries, resolve
//! the record, re-check its status after resolution (a racing delete may
//! have republished the entry between the probe and the dereference).
//! Records are never freed while a snapshot that could observe them is
//! live, so the dereference itself is always safe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::config::constants::MAX_CACHED_OLD_RECORDS;
use crate::error::StoreError;
use crate::index::{HashIndex, IndexPointer, LookupResult};
use crate::list::{DlList, LockTable, WriteArgs};
use crate::memory::{Arena, SpaceEntry};
use crate::records::{Record, RecordStatus, RecordType, NO_EXPIRE};
use crate::version::{OldDataRecord, OldDeleteRecord, OldRecordsCleaner, VersionController};
use crate::workers::WorkerToken;

/// Bytes of collection id prefixed to every element key.
pub const COLLECTION_ID_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

/// Outcome requested by a `modify` transformer.
pub enum ModifyOp {
    /// Replace the value.
    Write(Vec<u8>),
    /// Tombstone the key.
    Delete,
    /// Fail the operation with [`StoreError::Aborted`]; nothing is written.
    Abort,
    /// Keep the current state; nothing is written.
    Noop,
}

/// Records touched by a completed write. `written` is `None` for no-op
/// writes (deleting an absent or already-deleted key).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub existing: Option<u64>,
    pub written: Option<u64>,
}

/// Transient write descriptor threaded through the two-phase write.
pub struct HashWriteArgs {
    key: Vec<u8>,
    value: Vec<u8>,
    op: WriteOp,
    collection_id: u64,
    ts: u64,
    space: SpaceEntry,
    lookup: Option<LookupResult>,
}

impl HashWriteArgs {
    pub fn op(&self) -> WriteOp {
        self.op
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Space reserved by `prepare_write`; empty when the operation turned
    /// out to be a no-op.
    pub fn space(&self) -> SpaceEntry {
        self.space
    }
}

pub struct HashList {
    name: Box<[u8]>,
    id: u64,
    dl_list: DlList,
    size: AtomicU64,
    arena: Arc<Arena>,
    index: Arc<HashIndex>,
    version: Arc<VersionController>,
    cleaner: Arc<OldRecordsCleaner>,
    // serializes destructive maintenance against concurrent cleaning
    cleaning_lock: Mutex<()>,
}

impl HashList {
    /// Creates a collection: constructs its self-linked header record and
    /// publishes the collection name in the index.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &[u8],
        id: u64,
        ts: u64,
        arena: Arc<Arena>,
        index: Arc<HashIndex>,
        link_locks: Arc<LockTable>,
        version: Arc<VersionController>,
        cleaner: Arc<OldRecordsCleaner>,
    ) -> Result<HashList, StoreError> {
        let value = encode_collection_value(id);
        let space = arena.allocate(Record::record_size_for(name, &value));
        if space.is_empty() {
            return Err(StoreError::MemoryOverflow);
        }
        version.observe(ts);
        // SAFETY: fresh exclusive span from this arena.
        unsafe {
            Record::construct(
                arena.offset2addr_checked(space.offset),
                space.size,
                ts,
                RecordType::HashHeader,
                RecordStatus::Normal,
                crate::memory::NULL_OFFSET,
                space.offset,
                space.offset,
                name,
                &value,
                NO_EXPIRE,
            );
        }

        let lookup = index.lookup(name);
        index.insert(
            &lookup,
            RecordType::HashHeader,
            RecordStatus::Normal,
            IndexPointer::Collection(id),
        );

        Ok(HashList {
            name: name.into(),
            id,
            dl_list: DlList::new(space.offset, Arc::clone(&arena), link_locks),
            size: AtomicU64::new(0),
            arena,
            index,
            version,
            cleaner,
            cleaning_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn header_record(&self) -> &Record {
        self.dl_list.header()
    }

    pub fn expire_time(&self) -> i64 {
        self.header_record().expire_time()
    }

    pub fn has_expired(&self) -> bool {
        self.header_record().has_expired()
    }

    pub fn timestamp(&self) -> u64 {
        self.header_record().timestamp()
    }

    /// Approximate count of live (Normal) elements.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn update_size(&self, delta: i64) {
        self.size.fetch_add(delta as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn internal_key(&self, key: &[u8]) -> Vec<u8> {
        encode_internal_key(self.id, key)
    }

    /// Inserts or updates `key`.
    pub fn put(
        &self,
        worker: &WorkerToken,
        key: &[u8],
        value: &[u8],
        ts: u64,
    ) -> Result<WriteResult, StoreError> {
        let ikey = self.internal_key(key);
        let _bucket = self.index.acquire_lock(&ikey);
        let mut args = self.init_write_args(key, value, WriteOp::Put);
        self.prepare_write(&mut args, ts)?;
        self.write(worker, &mut args)
    }

    /// Looks up `key` without locks.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let ikey = self.internal_key(key);
        let lookup = self.index.lookup(&ikey);
        let entry = lookup.entry.ok_or(StoreError::NotFound)?;
        if entry.record_status == RecordStatus::Outdated {
            return Err(StoreError::NotFound);
        }
        let offset = match entry.pointer {
            IndexPointer::Record(offset) => offset,
            _ => return Err(StoreError::NotFound),
        };
        let record = Record::from_arena(&self.arena, offset);
        debug_assert_eq!(record.record_type(), RecordType::HashElem);
        // The entry may have been republished between the probe and this
        // dereference; the record's own status is authoritative.
        if record.status() == RecordStatus::Outdated {
            return Err(StoreError::NotFound);
        }
        Ok(record.value().to_vec())
    }

    /// Tombstones the latest record for `key`. Deleting an absent or
    /// already-deleted key is a no-op that reserves no space.
    pub fn delete(
        &self,
        worker: &WorkerToken,
        key: &[u8],
        ts: u64,
    ) -> Result<WriteResult, StoreError> {
        let ikey = self.internal_key(key);
        let _bucket = self.index.acquire_lock(&ikey);
        let mut args = self.init_write_args(key, b"", WriteOp::Delete);
        self.prepare_write(&mut args, ts)?;
        self.write(worker, &mut args)
    }

    /// Reads the current value (if any), applies `transform`, and performs
    /// the write it requests.
    pub fn modify(
        &self,
        worker: &WorkerToken,
        key: &[u8],
        transform: impl FnOnce(Option<&[u8]>) -> ModifyOp,
        ts: u64,
    ) -> Result<WriteResult, StoreError> {
        let ikey = self.internal_key(key);
        let _bucket = self.index.acquire_lock(&ikey);

        let lookup = self.index.lookup(&ikey);
        let mut existing = None;
        let mut existing_value = None;
        if let Some(entry) = lookup.entry {
            if let IndexPointer::Record(offset) = entry.pointer {
                let record = Record::from_arena(&self.arena, offset);
                if ts <= record.timestamp() {
                    return Err(StoreError::InvalidArgument);
                }
                existing = Some(offset);
                if record.status() == RecordStatus::Normal {
                    existing_value = Some(record.value().to_vec());
                }
            }
        }

        match transform(existing_value.as_deref()) {
            ModifyOp::Write(new_value) => {
                let space = self
                    .arena
                    .allocate(Record::record_size_for(&ikey, &new_value));
                if space.is_empty() {
                    return Err(StoreError::MemoryOverflow);
                }
                self.version.observe(ts);
                let mut args = self.init_write_args(key, &new_value, WriteOp::Put);
                args.ts = ts;
                args.space = space;
                args.lookup = Some(lookup);
                self.write(worker, &mut args)
            }
            ModifyOp::Delete => {
                if existing_value.is_none() {
                    // deleting an absent or tombstoned key is a no-op
                    return Ok(WriteResult {
                        existing,
                        written: None,
                    });
                }
                let space = self.arena.allocate(Record::record_size_for(&ikey, b""));
                if space.is_empty() {
                    return Err(StoreError::MemoryOverflow);
                }
                self.version.observe(ts);
                let mut args = self.init_write_args(key, b"", WriteOp::Delete);
                args.ts = ts;
                args.space = space;
                args.lookup = Some(lookup);
                self.write(worker, &mut args)
            }
            ModifyOp::Abort => Err(StoreError::Aborted),
            ModifyOp::Noop => Ok(WriteResult {
                existing,
                written: None,
            }),
        }
    }

    /// Rewrites the header record with a new expire time. The old header
    /// retires as an `OldDataRecord`.
    pub fn set_expire_time(
        &self,
        worker: &WorkerToken,
        expire_time: i64,
        ts: u64,
    ) -> Result<WriteResult, StoreError> {
        let header_off = self.dl_list.header_offset();
        let header = Record::from_arena(&self.arena, header_off);
        let space = self
            .arena
            .allocate(Record::record_size_for(header.key(), header.value()));
        if space.is_empty() {
            return Err(StoreError::MemoryOverflow);
        }
        self.version.observe(ts);
        // SAFETY: fresh exclusive span; linkage is provisional until
        // replace() re-links under the record locks.
        unsafe {
            Record::construct(
                self.arena.offset2addr_checked(space.offset),
                space.size,
                ts,
                RecordType::HashHeader,
                RecordStatus::Normal,
                header_off,
                header.prev(),
                header.next(),
                header.key(),
                header.value(),
                expire_time,
            );
        }
        let replaced = self.dl_list.replace(header_off, space.offset);
        debug_assert!(replaced, "existing header should be linked on its list");
        self.cleaner.push_data(
            worker,
            OldDataRecord {
                record: header_off,
                newer_version_timestamp: ts,
            },
        );
        Ok(WriteResult {
            existing: Some(header_off),
            written: Some(space.offset),
        })
    }

    /// Builds a write descriptor bound to this collection.
    pub fn init_write_args(&self, key: &[u8], value: &[u8], op: WriteOp) -> HashWriteArgs {
        debug_assert!(op == WriteOp::Put || value.is_empty());
        HashWriteArgs {
            key: key.to_vec(),
            value: value.to_vec(),
            op,
            collection_id: self.id,
            ts: 0,
            space: SpaceEntry::empty(),
            lookup: None,
        }
    }

    /// Resolves the lookup and reserves space for `args`. The sub-key's
    /// bucket lock must be held.
    pub fn prepare_write(&self, args: &mut HashWriteArgs, ts: u64) -> Result<(), StoreError> {
        if args.collection_id != self.id {
            return Err(StoreError::InvalidArgument);
        }
        args.ts = ts;
        self.version.observe(ts);

        let op_delete = args.op == WriteOp::Delete;
        let ikey = self.internal_key(&args.key);
        let lookup = self.index.lookup(&ikey);

        let mut allocate_space = true;
        match lookup.entry {
            Some(entry) => {
                if op_delete && entry.record_status == RecordStatus::Outdated {
                    allocate_space = false;
                }
                if let IndexPointer::Record(offset) = entry.pointer {
                    // A write that does not advance the key's version chain
                    // is rejected rather than silently reordered.
                    if ts <= Record::from_arena(&self.arena, offset).timestamp() {
                        return Err(StoreError::InvalidArgument);
                    }
                }
            }
            None => {
                if op_delete {
                    allocate_space = false;
                }
            }
        }

        if allocate_space {
            let request = Record::record_size_for(&ikey, &args.value);
            args.space = self.arena.allocate(request);
            if args.space.is_empty() {
                return Err(StoreError::MemoryOverflow);
            }
        }
        args.lookup = Some(lookup);
        Ok(())
    }

    /// Performs the write prepared in `args`. The sub-key's bucket lock
    /// must still be held.
    pub fn write(
        &self,
        worker: &WorkerToken,
        args: &mut HashWriteArgs,
    ) -> Result<WriteResult, StoreError> {
        if args.collection_id != self.id {
            return Err(StoreError::InvalidArgument);
        }
        let result = match args.op {
            WriteOp::Put => {
                let result = self.put_prepared(args)?;
                let fresh = match result.existing {
                    None => true,
                    Some(off) => {
                        Record::from_arena(&self.arena, off).status() == RecordStatus::Outdated
                    }
                };
                if fresh {
                    self.update_size(1);
                }
                result
            }
            WriteOp::Delete => {
                if args.space.is_empty() {
                    // tombstoning a tombstone or an absent key
                    return Ok(WriteResult::default());
                }
                let result = self.delete_prepared(args)?;
                self.update_size(-1);
                result
            }
        };

        if let Some(existing) = result.existing {
            let existing_rec = Record::from_arena(&self.arena, existing);
            match (args.op, existing_rec.status()) {
                (WriteOp::Put, RecordStatus::Normal) => self.cleaner.push_data(
                    worker,
                    OldDataRecord {
                        record: existing,
                        newer_version_timestamp: args.ts,
                    },
                ),
                // A superseded tombstone already rides the delete queue
                // since the delete that wrote it.
                (WriteOp::Put, RecordStatus::Outdated) => {}
                (WriteOp::Delete, _) => {
                    let ikey = self.internal_key(&args.key).into_boxed_slice();
                    self.cleaner.push_delete(
                        worker,
                        OldDeleteRecord {
                            record: existing,
                            internal_key: ikey.clone(),
                            newer_version_timestamp: args.ts,
                        },
                    );
                    if let Some(tombstone) = result.written {
                        self.cleaner.push_delete(
                            worker,
                            OldDeleteRecord {
                                record: tombstone,
                                internal_key: ikey,
                                newer_version_timestamp: args.ts,
                            },
                        );
                    }
                }
            }
        }
        Ok(result)
    }

    fn put_prepared(&self, args: &mut HashWriteArgs) -> Result<WriteResult, StoreError> {
        let ikey = self.internal_key(&args.key);
        let lookup = args.lookup.take().ok_or(StoreError::InvalidArgument)?;
        let write_args = WriteArgs::new(
            &ikey,
            &args.value,
            RecordType::HashElem,
            RecordStatus::Normal,
            args.ts,
            args.space,
        );

        let mut existing = None;
        let written = match lookup.entry {
            Some(entry) => {
                let current = match entry.pointer {
                    IndexPointer::Record(offset) => offset,
                    _ => return Err(StoreError::InvalidArgument),
                };
                if args.ts <= Record::from_arena(&self.arena, current).timestamp() {
                    return Err(StoreError::InvalidArgument);
                }
                existing = Some(current);
                // Retried on splice conflicts: the bucket lock keeps the
                // target current, so a conflict only means a neighbor moved.
                loop {
                    if let Ok(written) = self.dl_list.update(&write_args, current) {
                        break written;
                    }
                }
            }
            None => {
                // Fresh key: spread contention across the header's two
                // neighbors.
                if rand::random::<bool>() {
                    self.dl_list.push_back(&write_args)
                } else {
                    self.dl_list.push_front(&write_args)
                }
            }
        };

        self.index.insert(
            &lookup,
            RecordType::HashElem,
            RecordStatus::Normal,
            IndexPointer::Record(written),
        );
        Ok(WriteResult {
            existing,
            written: Some(written),
        })
    }

    fn delete_prepared(&self, args: &mut HashWriteArgs) -> Result<WriteResult, StoreError> {
        let ikey = self.internal_key(&args.key);
        let lookup = args.lookup.take().ok_or(StoreError::InvalidArgument)?;
        let entry = lookup.entry.ok_or(StoreError::InvalidArgument)?;
        debug_assert_eq!(entry.record_type, RecordType::HashElem);
        debug_assert_eq!(entry.record_status, RecordStatus::Normal);
        let existing = match entry.pointer {
            IndexPointer::Record(offset) => offset,
            _ => return Err(StoreError::InvalidArgument),
        };
        if args.ts <= Record::from_arena(&self.arena, existing).timestamp() {
            return Err(StoreError::InvalidArgument);
        }

        let write_args = WriteArgs::new(
            &ikey,
            b"",
            RecordType::HashElem,
            RecordStatus::Outdated,
            args.ts,
            args.space,
        );
        let written = loop {
            if let Ok(written) = self.dl_list.update(&write_args, existing) {
                break written;
            }
        };

        self.index.insert(
            &lookup,
            RecordType::HashElem,
            RecordStatus::Outdated,
            IndexPointer::Record(written),
        );
        Ok(WriteResult {
            existing: Some(existing),
            written: Some(written),
        })
    }

    /// Walks the list and verifies that every linked element resolves
    /// through the index to exactly that record and that its linkage is
    /// intact. Returns at the first mismatch; corruption is never silently
    /// repaired.
    pub fn check_index(&self) -> Result<(), StoreError> {
        for offset in self.dl_list.iter_offsets() {
            let record = Record::from_arena(&self.arena, offset);
            if !Self::match_type(record) || Self::fetch_id(record) != self.id {
                error!(offset, "check index: record of foreign type or collection on list");
                return Err(StoreError::Corruption);
            }
            match self.index.lookup(record.key()).entry {
                Some(entry) if entry.pointer == IndexPointer::Record(offset) => {}
                Some(_) => {
                    error!(offset, "check index: record mismatch with hash index");
                    return Err(StoreError::Corruption);
                }
                None => {
                    error!(offset, "check index: record not present in hash index");
                    return Err(StoreError::Corruption);
                }
            }
            if !self.dl_list.check_prev_linkage(offset)
                || !self.dl_list.check_next_linkage(offset)
            {
                error!(offset, "check index: record linkage broken");
                return Err(StoreError::Corruption);
            }
        }
        Ok(())
    }

    /// Tears the collection down: unlinks every newest-version record,
    /// erases its index entry if still published, destroys it, and batches
    /// its space back to the arena. Old version chains are left to their
    /// own retirement entries.
    pub fn destroy(&self) {
        let _cleaning = self.cleaning_lock.lock();
        self.destroy_walk(false);
    }

    /// Like [`HashList::destroy`], additionally freeing every historical
    /// version reachable through `old_version` chains. Used when
    /// obliterating a collection whose history is no longer referenced;
    /// retirements from this collection still queued in the cleaner must
    /// have been drained or abandoned by the caller.
    pub fn destroy_all(&self) {
        let _cleaning = self.cleaning_lock.lock();
        self.destroy_walk(true);
    }

    fn destroy_walk(&self, include_old_versions: bool) {
        let mut to_free: Vec<SpaceEntry> = Vec::new();
        let header_off = self.dl_list.header_offset();
        loop {
            let target = self.dl_list.header().next();
            let record = Record::from_arena(&self.arena, target);
            let key = record.key().to_vec();
            let _bucket = self.index.acquire_lock(&key);
            if self.dl_list.remove(target) {
                self.index.erase_if(&key, |entry| match entry.pointer {
                    IndexPointer::Record(offset) => offset == target,
                    IndexPointer::Collection(id) => id == self.id && target == header_off,
                    IndexPointer::Empty => false,
                });

                if include_old_versions {
                    let mut old_off = record.old_version();
                    while let Some(old) = Record::try_from_arena(&self.arena, old_off) {
                        // a destroyed chain node already belongs to the
                        // cleaner; everything behind it does too
                        if old.record_type() == RecordType::Empty {
                            break;
                        }
                        let next_old = old.old_version();
                        to_free.push(old.space(&self.arena));
                        old.destroy();
                        old_off = next_old;
                    }
                }

                to_free.push(record.space(&self.arena));
                record.destroy();
                if to_free.len() > MAX_CACHED_OLD_RECORDS {
                    self.arena.batch_free(&to_free);
                    to_free.clear();
                }
            }
            if target == header_off {
                break;
            }
        }
        self.arena.batch_free(&to_free);
    }

    /// Serializes destructive maintenance against concurrent cleaning.
    pub fn try_cleaning_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.cleaning_lock.try_lock()
    }

    /// The collection id a record belongs to. A record of neither element
    /// nor header type here is a storage-format violation with no safe
    /// continuation.
    pub fn fetch_id(record: &Record) -> u64 {
        match record.record_type() {
            RecordType::HashElem => extract_id(record.key()),
            RecordType::HashHeader => decode_collection_id(record.value()),
            other => {
                error!(?other, "unexpected record type in collection id fetch");
                std::process::abort();
            }
        }
    }

    pub fn match_type(record: &Record) -> bool {
        matches!(
            record.record_type(),
            RecordType::HashElem | RecordType::HashHeader
        )
    }
}

/// `collection_id (8 bytes LE) || user sub-key`.
pub fn encode_internal_key(id: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COLLECTION_ID_SIZE + key.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(key);
    out
}

/// Collection id prefix of an internal key.
pub fn extract_id(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= COLLECTION_ID_SIZE);
    let mut raw = [0u8; COLLECTION_ID_SIZE];
    raw.copy_from_slice(&internal_key[..COLLECTION_ID_SIZE]);
    u64::from_le_bytes(raw)
}

/// Header-record value: the collection id (metadata may follow it).
pub fn encode_collection_value(id: u64) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn decode_collection_id(value: &[u8]) -> u64 {
    debug_assert!(value.len() >= COLLECTION_ID_SIZE);
    let mut raw = [0u8; COLLECTION_ID_SIZE];
    raw.copy_from_slice(&value[..COLLECTION_ID_SIZE]);
    u64::from_le_bytes(raw)
}
