//! # Record Layout
//!
//! The sole persistent unit of a collection: a 64-byte header followed by
//! key bytes, value bytes, and padding out to a 64-byte multiple.
//!
//! ## Binary Layout (little-endian, 64-byte aligned)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------------
//! 0       4     checksum       (timestamp..value bytes; not linkage)
//! 4       4     record_size    (total, including header and padding)
//! 8       8     timestamp      (monotonic stamp assigned at write time)
//! 16      8     prev           (offset of previous list record; atomic)
//! 24      8     next           (offset of next list record; atomic)
//! 32      8     old_version    (offset of superseded record or null; atomic)
//! 40      8     expire_time    (absolute unix millis; 0 = never)
//! 48      4     key_len
//! 52      4     value_len
//! 56      1     record_type    (atomic; poisoned to Empty by destroy)
//! 57      1     record_status
//! 58      6     reserved
//! 64      ...   key bytes, then value bytes, padded to 64
//! ```
//!
//! The three linkage words and the type byte are the only fields mutated
//! after a record is published, which is why they are atomics: lock-free
//! readers walk `next`/`prev`/`old_version` while writers splice. Every
//! other field is sealed at construction, so the 8-byte fields use
//! zerocopy's little-endian wrappers and stay bit-stable.
//!
//! ## Checksum
//!
//! CRC32 (iSCSI polynomial) over the immutable metadata and the payload.
//! Linkage words, `expire_time`, and `record_size` are excluded: linkage
//! mutates after sealing, and the other two are recomputable from context.
//! `destroy()` poisons the type byte, so a destroyed slot fails
//! `validate()` and post-mortem scans reject it.
//!
//! ## Version Chains
//!
//! `old_version` links a record to the record it superseded at the same
//! key. Chains are strictly decreasing in timestamp and terminate at the
//! null offset; they are walked by snapshot readers and torn down by the
//! cleaner and by full-collection destruction.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use zerocopy::little_endian::{I64, U32, U64};

use crate::memory::{Arena, NULL_OFFSET};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Header size; also the alignment of every record offset.
pub const RECORD_HEADER_SIZE: usize = 64;

/// Expire-time value meaning "never expires".
pub const NO_EXPIRE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Unoccupied or destroyed slot.
    Empty = 0,
    /// Sentinel record carrying collection name, id, and expiry.
    HashHeader = 1,
    /// Element record carrying one sub-key and its value.
    HashElem = 2,
}

impl RecordType {
    #[inline]
    pub fn from_u8(raw: u8) -> RecordType {
        match raw {
            1 => RecordType::HashHeader,
            2 => RecordType::HashElem,
            _ => RecordType::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordStatus {
    /// Up-to-date live record.
    Normal = 0,
    /// Tombstone: the key is logically deleted.
    Outdated = 1,
}

impl RecordStatus {
    #[inline]
    pub fn from_u8(raw: u8) -> RecordStatus {
        if raw == 1 {
            RecordStatus::Outdated
        } else {
            RecordStatus::Normal
        }
    }
}

/// In-memory view of an on-storage record header. Payload bytes follow the
/// header in the same arena span and are reached by pointer arithmetic.
#[repr(C)]
pub struct Record {
    checksum: U32,
    record_size: U32,
    timestamp: U64,
    prev: AtomicU64,
    next: AtomicU64,
    old_version: AtomicU64,
    expire_time: I64,
    key_len: U32,
    value_len: U32,
    record_type: AtomicU8,
    record_status: u8,
    reserved: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<Record>() == RECORD_HEADER_SIZE);
const _: () = assert!(std::mem::align_of::<Record>() <= RECORD_HEADER_SIZE);

impl Record {
    /// Total bytes a record for `key`/`value` occupies, header and padding
    /// included. Callers size arena requests with this.
    #[inline]
    pub fn record_size_for(key: &[u8], value: &[u8]) -> u64 {
        let raw = RECORD_HEADER_SIZE as u64 + key.len() as u64 + value.len() as u64;
        (raw + (RECORD_HEADER_SIZE as u64 - 1)) & !(RECORD_HEADER_SIZE as u64 - 1)
    }

    /// Constructs a record in the reserved span at `addr` and seals its
    /// checksum. The record is not yet reachable; linkage publication is the
    /// caller's next step.
    ///
    /// # Safety
    ///
    /// `addr` must point at a span of at least `space_size` bytes reserved
    /// exclusively for this record, 64-byte aligned, inside an arena that
    /// outlives the returned reference.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn construct<'a>(
        addr: *mut u8,
        space_size: u64,
        timestamp: u64,
        record_type: RecordType,
        record_status: RecordStatus,
        old_version: u64,
        prev: u64,
        next: u64,
        key: &[u8],
        value: &[u8],
        expire_time: i64,
    ) -> &'a Record {
        debug_assert!(space_size >= Self::record_size_for(key, value));
        debug_assert_eq!(addr as usize % RECORD_HEADER_SIZE, 0);

        let header = Record {
            checksum: U32::new(0),
            record_size: U32::new(space_size as u32),
            timestamp: U64::new(timestamp),
            prev: AtomicU64::new(prev),
            next: AtomicU64::new(next),
            old_version: AtomicU64::new(old_version),
            expire_time: I64::new(expire_time),
            key_len: U32::new(key.len() as u32),
            value_len: U32::new(value.len() as u32),
            record_type: AtomicU8::new(record_type as u8),
            record_status: record_status as u8,
            reserved: [0; 6],
        };
        std::ptr::write(addr as *mut Record, header);

        let payload = addr.add(RECORD_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(key.as_ptr(), payload, key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), payload.add(key.len()), value.len());

        let record = &mut *(addr as *mut Record);
        record.checksum = U32::new(record.compute_checksum());
        &*(addr as *const Record)
    }

    /// Resolves a record from its arena offset.
    ///
    /// The returned reference is valid while the arena lives; whether the
    /// slot still holds a live record is governed by the reclamation
    /// protocol (retired spans are not recycled while any snapshot that
    /// could reach them is open).
    #[inline]
    pub fn from_arena(arena: &Arena, offset: u64) -> &Record {
        // SAFETY: offset2addr_checked bounds-checks against the arena, and
        // record spans are 64-byte aligned by the allocation protocol.
        unsafe { &*(arena.offset2addr_checked(offset) as *const Record) }
    }

    /// Like [`Record::from_arena`] but maps the null sentinel (and any
    /// out-of-range offset) to `None`. Used for walking version chains.
    #[inline]
    pub fn try_from_arena(arena: &Arena, offset: u64) -> Option<&Record> {
        if offset == NULL_OFFSET {
            return None;
        }
        // SAFETY: bounds-checked by offset2addr; alignment per allocation
        // protocol.
        arena
            .offset2addr(offset)
            .map(|addr| unsafe { &*(addr as *const Record) })
    }

    zerocopy_getters! {
        record_size: u32,
        timestamp: u64,
        expire_time: i64,
        key_len: u32,
        value_len: u32,
    }

    #[inline]
    pub fn record_type(&self) -> RecordType {
        RecordType::from_u8(self.record_type.load(Ordering::Acquire))
    }

    #[inline]
    pub fn status(&self) -> RecordStatus {
        RecordStatus::from_u8(self.record_status)
    }

    #[inline]
    pub fn prev(&self) -> u64 {
        self.prev.load(Ordering::Acquire)
    }

    #[inline]
    pub fn next(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn old_version(&self) -> u64 {
        self.old_version.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_prev(&self, offset: u64) {
        self.prev.store(offset, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_next(&self, offset: u64) {
        self.next.store(offset, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_old_version(&self, offset: u64) {
        self.old_version.store(offset, Ordering::Release);
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        // SAFETY: key bytes immediately follow the header inside this
        // record's span; key_len was sealed at construction.
        unsafe {
            let base = (self as *const Record as *const u8).add(RECORD_HEADER_SIZE);
            std::slice::from_raw_parts(base, self.key_len() as usize)
        }
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        // SAFETY: value bytes follow the key inside this record's span;
        // both lengths were sealed at construction.
        unsafe {
            let base = (self as *const Record as *const u8)
                .add(RECORD_HEADER_SIZE + self.key_len() as usize);
            std::slice::from_raw_parts(base, self.value_len() as usize)
        }
    }

    pub fn has_expired(&self) -> bool {
        let expire = self.expire_time();
        expire != NO_EXPIRE && expire <= unix_millis_now()
    }

    /// Recomputes the checksum and compares it against the sealed one. A
    /// destroyed record always fails: its type byte was poisoned after
    /// sealing.
    pub fn validate(&self) -> bool {
        let lens_ok = self.key_len() as u64 + self.value_len() as u64
            + RECORD_HEADER_SIZE as u64
            <= self.record_size() as u64;
        lens_ok && self.compute_checksum() == self.checksum.get()
    }

    /// Poisons the slot so post-mortem scans reject it. Called only once
    /// the record is unlinked and owned by the reclamation pipeline.
    pub fn destroy(&self) {
        self.record_type
            .store(RecordType::Empty as u8, Ordering::Release);
    }

    /// The record's span, for handing back to the arena.
    #[inline]
    pub fn space(&self, arena: &Arena) -> crate::memory::SpaceEntry {
        crate::memory::SpaceEntry::new(
            arena.addr2offset_checked(self as *const Record as *const u8),
            self.record_size() as u64,
        )
    }

    fn compute_checksum(&self) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&self.timestamp().to_le_bytes());
        digest.update(&[self.record_type.load(Ordering::Acquire)]);
        digest.update(&[self.record_status]);
        digest.update(&self.key_len().to_le_bytes());
        digest.update(&self.value_len().to_le_bytes());
        digest.update(self.key());
        digest.update(self.value());
        digest.finalize()
    }
}

/// Wall-clock unix time in milliseconds, the unit of `expire_time`.
pub fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
