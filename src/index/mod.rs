//! # Hash Index
//!
//! Sharded map from internal keys to index entries. The index is the
//! single source of truth for "which record is current for this key":
//! exactly one record per sub-key is reachable through it at any time.
//!
//! ## Structure
//!
//! ```text
//! HashIndex
//! ├── shards[0..N]: RwLock<HashMap<internal key, HashEntry>>
//! └── key_locks[0..M]: Mutex  (striped per-key write locks)
//! ```
//!
//! Shard locks guard map structure and are held only for the probe or the
//! mutation itself. Key locks serialize writers on one sub-key for a whole
//! prepare+write cycle and are always acquired before any link lock
//! (bucket lock -> link lock, the crate-wide lock order).
//!
//! ## Entries
//!
//! An entry carries the record type, the record status as published by the
//! last writer, and a tagged pointer: a record offset, a collection id (for
//! collection-name entries), or empty. Readers probe without taking the
//! key lock; the status stored in the entry lets a get reject tombstoned
//! keys without dereferencing the record.
//!
//! ## Double-Checked Mutation
//!
//! The cleaner must clear an entry only if it still points at the tombstone
//! being purged. [`HashIndex::erase_if`] re-resolves the entry by key under
//! the shard write lock and applies the predicate there, which gives the
//! same guarantee the original double-checked pointer comparison provided,
//! without holding interior pointers into bucket storage.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::records::{RecordStatus, RecordType};

/// What an index entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPointer {
    /// Offset of the current record for this key.
    Record(u64),
    /// A collection handle, keyed by collection name.
    Collection(u64),
    /// Reserved entry with nothing published yet.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    pub record_type: RecordType,
    pub record_status: RecordStatus,
    pub pointer: IndexPointer,
}

/// Outcome of a probe, carrying the probed key so a subsequent insert
/// targets exactly what was looked up.
pub struct LookupResult {
    pub entry: Option<HashEntry>,
    key: Box<[u8]>,
    shard: usize,
}

impl LookupResult {
    #[inline]
    pub fn is_found(&self) -> bool {
        self.entry.is_some()
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

pub struct HashIndex {
    shards: Box<[RwLock<HashMap<Box<[u8]>, HashEntry>>]>,
    key_locks: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl HashIndex {
    pub fn new(shard_count: usize, key_lock_stripes: usize) -> Self {
        assert!(shard_count.is_power_of_two());
        assert!(key_lock_stripes.is_power_of_two());
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            key_locks: (0..key_lock_stripes).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn hash_key(&self, key: &[u8]) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    #[inline]
    fn shard_of(&self, key: &[u8]) -> usize {
        (self.hash_key(key) as usize) & (self.shards.len() - 1)
    }

    /// Serializes writers on one key. Held across a whole prepare+write
    /// cycle; the cleaner takes it before repointing or clearing entries.
    pub fn acquire_lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let stripe = (self.hash_key(key) as usize) & (self.key_locks.len() - 1);
        self.key_locks[stripe].lock()
    }

    /// Probes for `key`. Takes only the shard read lock for the probe
    /// itself, so reads never wait on writers of other keys.
    pub fn lookup(&self, key: &[u8]) -> LookupResult {
        let shard = self.shard_of(key);
        let entry = self.shards[shard].read().get(key).copied();
        LookupResult {
            entry,
            key: key.into(),
            shard,
        }
    }

    /// Publishes `pointer` for the key probed by `lookup`. Inserts the
    /// entry if the probe missed, updates it in place otherwise.
    pub fn insert(
        &self,
        lookup: &LookupResult,
        record_type: RecordType,
        record_status: RecordStatus,
        pointer: IndexPointer,
    ) {
        let entry = HashEntry {
            record_type,
            record_status,
            pointer,
        };
        self.shards[lookup.shard]
            .write()
            .insert(lookup.key.clone(), entry);
    }

    /// Erases the entry for `key` iff the current entry satisfies `pred`.
    /// Returns whether an erase happened. The predicate runs under the
    /// shard write lock, making check-then-erase atomic.
    pub fn erase_if(&self, key: &[u8], pred: impl FnOnce(&HashEntry) -> bool) -> bool {
        let shard = self.shard_of(key);
        let mut map = self.shards[shard].write();
        match map.get(key) {
            Some(entry) if pred(entry) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Total entries across shards. Point-in-time, for diagnostics.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
