//! Circular doubly-linked list of records addressed by arena offsets.
//!
//! The list never owns record payloads; it owns linkage. All operations
//! follow the same shape: read the splice point, lock its stripes,
//! re-validate, construct (if inserting), publish. Validation failure after
//! locking is a lost race reported as [`SpliceConflict`]; callers retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::memory::{Arena, SpaceEntry};
use crate::records::{Record, RecordStatus, RecordType, NO_EXPIRE};

use super::lock_table::{LockTable, MultiGuard};

/// Internal retry signal: the splice point changed between resolution and
/// lock acquisition. Never surfaced to collection callers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpliceConflict;

/// Descriptor for one record write into the list.
pub struct WriteArgs<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub ts: u64,
    pub space: SpaceEntry,
}

impl<'a> WriteArgs<'a> {
    pub fn new(
        key: &'a [u8],
        value: &'a [u8],
        record_type: RecordType,
        status: RecordStatus,
        ts: u64,
        space: SpaceEntry,
    ) -> Self {
        debug_assert!(space.size >= Record::record_size_for(key, value));
        Self {
            key,
            value,
            record_type,
            status,
            ts,
            space,
        }
    }
}

pub struct DlList {
    header: AtomicU64,
    arena: Arc<Arena>,
    locks: Arc<LockTable>,
}

impl DlList {
    pub fn new(header_offset: u64, arena: Arc<Arena>, locks: Arc<LockTable>) -> Self {
        Self {
            header: AtomicU64::new(header_offset),
            arena,
            locks,
        }
    }

    #[inline]
    pub fn header_offset(&self) -> u64 {
        self.header.load(Ordering::Acquire)
    }

    #[inline]
    pub fn header(&self) -> &Record {
        Record::from_arena(&self.arena, self.header_offset())
    }

    /// Splices a new record right after the header, retrying internally
    /// until the splice wins. Returns the new record's offset.
    pub(crate) fn push_front(&self, args: &WriteArgs) -> u64 {
        loop {
            let header_off = self.header_offset();
            if let Ok(off) = self.insert_after(args, header_off) {
                return off;
            }
        }
    }

    /// Splices a new record right before the header (list tail), retrying
    /// internally until the splice wins. Returns the new record's offset.
    pub(crate) fn push_back(&self, args: &WriteArgs) -> u64 {
        loop {
            let header_off = self.header_offset();
            if let Ok(off) = self.insert_before(args, header_off) {
                return off;
            }
        }
    }

    pub(crate) fn insert_after(&self, args: &WriteArgs, prev: u64) -> Result<u64, SpliceConflict> {
        let next = Record::from_arena(&self.arena, prev).next();
        self.insert_between(args, prev, next)
    }

    pub(crate) fn insert_before(&self, args: &WriteArgs, next: u64) -> Result<u64, SpliceConflict> {
        let prev = Record::from_arena(&self.arena, next).prev();
        self.insert_between(args, prev, next)
    }

    /// Inserts a fresh record between `prev` and `next`. Conflict if the
    /// two are no longer adjacent once the insert lock is held.
    pub(crate) fn insert_between(
        &self,
        args: &WriteArgs,
        prev_off: u64,
        next_off: u64,
    ) -> Result<u64, SpliceConflict> {
        // Locking prev's stripe is sufficient for an insert: any competing
        // edit of this link must lock the same stripe before publishing.
        let _guard = self.locks.lock(prev_off);
        let prev = Record::from_arena(&self.arena, prev_off);
        let next = Record::from_arena(&self.arena, next_off);
        if prev.next() != next_off || next.prev() != prev_off {
            return Err(SpliceConflict);
        }

        let new_off = args.space.offset;
        // SAFETY: args.space was reserved from this arena for this write and
        // nothing else references it yet.
        unsafe {
            Record::construct(
                self.arena.offset2addr_checked(new_off),
                args.space.size,
                args.ts,
                args.record_type,
                args.status,
                crate::memory::NULL_OFFSET,
                prev_off,
                next_off,
                args.key,
                args.value,
                NO_EXPIRE,
            );
        }
        prev.set_next(new_off);
        next.set_prev(new_off);
        Ok(new_off)
    }

    /// Replaces `current` with a fresh record that inherits its linkage and
    /// records it as `old_version`. Conflict if `current` is no longer
    /// linked (a racing edit replaced or unlinked it).
    pub(crate) fn update(&self, args: &WriteArgs, current: u64) -> Result<u64, SpliceConflict> {
        debug_assert_eq!(Record::from_arena(&self.arena, current).key(), args.key);
        let (_guard, prev_off, next_off) = acquire_record_lock(&self.arena, &self.locks, current);
        let prev = Record::from_arena(&self.arena, prev_off);
        let next = Record::from_arena(&self.arena, next_off);
        if prev.next() != current || next.prev() != current {
            return Err(SpliceConflict);
        }

        let new_off = args.space.offset;
        // SAFETY: args.space was reserved from this arena for this write and
        // nothing else references it yet.
        unsafe {
            Record::construct(
                self.arena.offset2addr_checked(new_off),
                args.space.size,
                args.ts,
                args.record_type,
                args.status,
                current,
                prev_off,
                next_off,
                args.key,
                args.value,
                NO_EXPIRE,
            );
        }
        prev.set_next(new_off);
        next.set_prev(new_off);
        Ok(new_off)
    }

    /// Swaps an already-constructed `new_record` into `old_record`'s list
    /// position. Returns false only if `old_record` is not linked. Used by
    /// header rewrites.
    pub(crate) fn replace(&self, old_record: u64, new_record: u64) -> bool {
        let ret = Self::replace_at(&self.arena, &self.locks, old_record, new_record);
        if ret && self.header_offset() == old_record {
            self.header.store(new_record, Ordering::Release);
        }
        ret
    }

    pub(crate) fn replace_at(
        arena: &Arena,
        locks: &LockTable,
        old_record: u64,
        new_record: u64,
    ) -> bool {
        let (_guard, prev_off, next_off) = acquire_record_lock(arena, locks, old_record);
        let old = Record::from_arena(arena, old_record);
        let prev = Record::from_arena(arena, prev_off);
        let on_list = prev.next() == old_record;
        if on_list {
            let new = Record::from_arena(arena, new_record);
            if prev_off == old_record && next_off == old_record {
                // Sole record in the list (a header). Self-link the
                // replacement and break the old record's linkage so scans
                // reject it.
                debug_assert_eq!(new.record_type(), RecordType::HashHeader);
                new.set_prev(new_record);
                new.set_next(new_record);
                old.set_prev(new_record);
            } else {
                let next = Record::from_arena(arena, next_off);
                new.set_prev(prev_off);
                new.set_next(next_off);
                prev.set_next(new_record);
                next.set_prev(new_record);
            }
        }
        on_list
    }

    /// Unlinks a record, leaving the list consistent. Returns false if the
    /// record was already unlinked.
    pub(crate) fn remove(&self, record: u64) -> bool {
        Self::remove_at(&self.arena, &self.locks, record)
    }

    pub(crate) fn remove_at(arena: &Arena, locks: &LockTable, record: u64) -> bool {
        let (_guard, prev_off, next_off) = acquire_record_lock(arena, locks, record);
        let prev = Record::from_arena(arena, prev_off);
        let next = Record::from_arena(arena, next_off);
        let on_list = prev.next() == record;
        if on_list {
            // Reverse of the insertion publish order: break the backward
            // link first so an interrupted unlink leaves the forward chain
            // intact for repair.
            next.set_prev(prev_off);
            prev.set_next(next_off);
        }
        on_list
    }

    /// Forward linkage is intact: the successor points back at `record`.
    pub fn check_next_linkage(&self, record: u64) -> bool {
        let rec = Record::from_arena(&self.arena, record);
        let next = Record::from_arena(&self.arena, rec.next());
        next.prev() == record
    }

    /// Backward linkage is intact: the predecessor points forward at
    /// `record`.
    pub fn check_prev_linkage(&self, record: u64) -> bool {
        let rec = Record::from_arena(&self.arena, record);
        let prev = Record::from_arena(&self.arena, rec.prev());
        prev.next() == record
    }

    /// Offsets of the element records currently linked, front to back.
    /// A point-in-time walk: concurrent edits may or may not be observed.
    pub fn iter_offsets(&self) -> OffsetIter<'_> {
        let header = self.header_offset();
        OffsetIter {
            list: self,
            header,
            current: self.header().next(),
        }
    }
}

pub struct OffsetIter<'a> {
    list: &'a DlList,
    header: u64,
    current: u64,
}

impl Iterator for OffsetIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.current == self.header {
            return None;
        }
        let off = self.current;
        self.current = Record::from_arena(&self.list.arena, off).next();
        Some(off)
    }
}

/// Locks the stripes guarding `record` and its predecessor, looping until
/// the record's linkage is stable under the locks. Returns the guard with
/// the observed `(prev, next)` offsets.
fn acquire_record_lock<'a>(
    arena: &Arena,
    locks: &'a LockTable,
    record: u64,
) -> (MultiGuard<'a>, u64, u64) {
    loop {
        let rec = Record::from_arena(arena, record);
        let prev_off = rec.prev();
        let next_off = rec.next();
        let guard = locks.multi_lock(prev_off, record);
        // Linkage may have changed before the locks landed.
        if rec.prev() == prev_off && rec.next() == next_off {
            return (guard, prev_off, next_off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NULL_OFFSET;

    fn list_with_header() -> (Arc<Arena>, DlList) {
        let arena = Arc::new(Arena::new(1 << 16).unwrap());
        let locks = Arc::new(LockTable::new(64));
        let space = arena.allocate(Record::record_size_for(b"coll", b""));
        // SAFETY: fresh exclusive span.
        unsafe {
            Record::construct(
                arena.offset2addr_checked(space.offset),
                space.size,
                1,
                RecordType::HashHeader,
                RecordStatus::Normal,
                NULL_OFFSET,
                space.offset,
                space.offset,
                b"coll",
                b"",
                NO_EXPIRE,
            );
        }
        let list = DlList::new(space.offset, Arc::clone(&arena), locks);
        (arena, list)
    }

    fn push(list: &DlList, arena: &Arena, key: &[u8], value: &[u8], ts: u64, front: bool) -> u64 {
        let space = arena.allocate(Record::record_size_for(key, value));
        let args = WriteArgs::new(
            key,
            value,
            RecordType::HashElem,
            RecordStatus::Normal,
            ts,
            space,
        );
        if front {
            list.push_front(&args)
        } else {
            list.push_back(&args)
        }
    }

    #[test]
    fn empty_list_is_self_linked() {
        let (_arena, list) = list_with_header();
        let header = list.header();
        assert_eq!(header.next(), list.header_offset());
        assert_eq!(header.prev(), list.header_offset());
        assert_eq!(list.iter_offsets().count(), 0);
    }

    #[test]
    fn push_front_and_back_keep_cycle() {
        let (arena, list) = list_with_header();
        let a = push(&list, &arena, b"a", b"1", 10, true);
        let b = push(&list, &arena, b"b", b"2", 11, false);
        let c = push(&list, &arena, b"c", b"3", 12, true);

        let offsets: Vec<u64> = list.iter_offsets().collect();
        assert_eq!(offsets, vec![c, a, b]);
        for off in offsets {
            assert!(list.check_prev_linkage(off));
            assert!(list.check_next_linkage(off));
        }
    }

    #[test]
    fn update_replaces_in_place_and_chains_old_version() {
        let (arena, list) = list_with_header();
        let a = push(&list, &arena, b"a", b"1", 10, true);
        let b = push(&list, &arena, b"b", b"2", 11, false);

        let space = arena.allocate(Record::record_size_for(b"a", b"9"));
        let args = WriteArgs::new(
            b"a",
            b"9",
            RecordType::HashElem,
            RecordStatus::Normal,
            20,
            space,
        );
        let a2 = list.update(&args, a).unwrap();

        let offsets: Vec<u64> = list.iter_offsets().collect();
        assert_eq!(offsets, vec![a2, b]);

        let rec = Record::from_arena(&arena, a2);
        assert_eq!(rec.old_version(), a);
        assert_eq!(rec.value(), b"9");
        assert_eq!(Record::from_arena(&arena, a).timestamp(), 10);
    }

    #[test]
    fn update_of_unlinked_record_conflicts() {
        let (arena, list) = list_with_header();
        let a = push(&list, &arena, b"a", b"1", 10, true);
        assert!(list.remove(a));

        let space = arena.allocate(Record::record_size_for(b"a", b"2"));
        let args = WriteArgs::new(
            b"a",
            b"2",
            RecordType::HashElem,
            RecordStatus::Normal,
            20,
            space,
        );
        assert!(list.update(&args, a).is_err());
    }

    #[test]
    fn remove_unlinks_once() {
        let (arena, list) = list_with_header();
        let a = push(&list, &arena, b"a", b"1", 10, true);
        let b = push(&list, &arena, b"b", b"2", 11, false);
        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert_eq!(list.iter_offsets().collect::<Vec<_>>(), vec![b]);
        assert!(list.check_prev_linkage(b));
        assert!(list.check_next_linkage(b));
    }

    #[test]
    fn replace_swaps_header_of_sole_record() {
        let (arena, list) = list_with_header();
        let old_header = list.header_offset();
        let space = arena.allocate(Record::record_size_for(b"coll", b""));
        // SAFETY: fresh exclusive span.
        unsafe {
            Record::construct(
                arena.offset2addr_checked(space.offset),
                space.size,
                5,
                RecordType::HashHeader,
                RecordStatus::Normal,
                old_header,
                NULL_OFFSET,
                NULL_OFFSET,
                b"coll",
                b"",
                NO_EXPIRE,
            );
        }
        assert!(list.replace(old_header, space.offset));
        assert_eq!(list.header_offset(), space.offset);
        let header = list.header();
        assert_eq!(header.next(), space.offset);
        assert_eq!(header.prev(), space.offset);
        // replace is idempotent-unfriendly by design: the old header is off
        // the list now
        assert!(!list.replace(old_header, space.offset));
    }

    #[test]
    fn replace_keeps_element_neighbors() {
        let (arena, list) = list_with_header();
        let a = push(&list, &arena, b"a", b"1", 10, true);
        let b = push(&list, &arena, b"b", b"2", 11, false);

        let old_header = list.header_offset();
        let space = arena.allocate(Record::record_size_for(b"coll", b""));
        // SAFETY: fresh exclusive span.
        unsafe {
            Record::construct(
                arena.offset2addr_checked(space.offset),
                space.size,
                20,
                RecordType::HashHeader,
                RecordStatus::Normal,
                old_header,
                NULL_OFFSET,
                NULL_OFFSET,
                b"coll",
                b"",
                NO_EXPIRE,
            );
        }
        assert!(list.replace(old_header, space.offset));
        assert_eq!(list.iter_offsets().collect::<Vec<_>>(), vec![a, b]);
        assert!(list.check_prev_linkage(a));
        assert!(list.check_next_linkage(b));
    }
}
