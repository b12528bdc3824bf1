//! Fixed-capacity arena with segregated free lists.
//!
//! The arena owns one heap allocation for its whole lifetime, so every
//! offset handed out stays dereferenceable until the arena is dropped.
//! Reuse of freed spans is the caller's protocol to gate (the old-records
//! cleaner does this with snapshot timestamps).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::constants::RECORD_ALIGN;

/// Null sentinel for record offsets. Offset zero is a valid record position
/// (the first span in the arena), so null must live out of band.
pub const NULL_OFFSET: u64 = u64::MAX;

/// A reserved or freed span of arena space. `size == 0` signals an
/// allocation failure; callers check it instead of unwrapping a `Result`
/// because exhaustion is an expected, recoverable outcome on the write
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEntry {
    pub offset: u64,
    pub size: u64,
}

impl SpaceEntry {
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub const fn empty() -> Self {
        Self { offset: 0, size: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

pub struct Arena {
    base: NonNull<u8>,
    capacity: u64,
    tail: AtomicU64,
    // size class -> LIFO of freed offsets
    free_lists: Mutex<HashMap<u64, Vec<u64>>>,
    allocated: AtomicI64,
}

// SAFETY: the arena hands out raw pointers but owns the backing allocation
// exclusively; concurrent mutation through those pointers is governed by the
// record linkage and reclamation protocols, not by &mut aliasing.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena with at least `capacity` bytes, rounded up to the
    /// record alignment.
    pub fn new(capacity: u64) -> Result<Self> {
        let capacity = capacity
            .checked_add(RECORD_ALIGN - 1)
            .map(|c| c & !(RECORD_ALIGN - 1))
            .unwrap_or(0);
        ensure!(capacity >= RECORD_ALIGN, "arena capacity too small");
        ensure!(
            capacity <= isize::MAX as u64,
            "arena capacity {} exceeds addressable range",
            capacity
        );

        let layout = Layout::from_size_align(capacity as usize, RECORD_ALIGN as usize)
            .map_err(|e| eyre::eyre!("bad arena layout: {e}"))?;
        // SAFETY: layout has non-zero size (checked above) and a valid
        // power-of-two alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            eyre::eyre!("failed to allocate {} byte arena", capacity)
        })?;

        Ok(Self {
            base,
            capacity,
            tail: AtomicU64::new(0),
            free_lists: Mutex::new(HashMap::new()),
            allocated: AtomicI64::new(0),
        })
    }

    /// Reserves `size` bytes (rounded up to the record alignment). Returns
    /// an empty entry on exhaustion.
    pub fn allocate(&self, size: u64) -> SpaceEntry {
        if size == 0 {
            return SpaceEntry::empty();
        }
        let size = match size.checked_add(RECORD_ALIGN - 1) {
            Some(s) => s & !(RECORD_ALIGN - 1),
            None => return SpaceEntry::empty(),
        };

        if let Some(offset) = self.free_lists.lock().get_mut(&size).and_then(Vec::pop) {
            self.allocated.fetch_add(size as i64, Ordering::Relaxed);
            return SpaceEntry::new(offset, size);
        }

        // Bump from the tail. fetch_add may overshoot capacity; the overshot
        // region is simply never handed out again, which keeps the fast path
        // free of a CAS loop.
        let offset = self.tail.fetch_add(size, Ordering::Relaxed);
        if offset.checked_add(size).map_or(true, |end| end > self.capacity) {
            return SpaceEntry::empty();
        }
        self.allocated.fetch_add(size as i64, Ordering::Relaxed);
        SpaceEntry::new(offset, size)
    }

    /// Returns a span to its size-class free list. Freeing the same span
    /// twice is a caller bug the arena does not detect.
    pub fn free(&self, entry: SpaceEntry) {
        if entry.is_empty() {
            return;
        }
        debug_assert_eq!(entry.offset % RECORD_ALIGN, 0);
        debug_assert_eq!(entry.size % RECORD_ALIGN, 0);
        self.free_lists
            .lock()
            .entry(entry.size)
            .or_default()
            .push(entry.offset);
        self.allocated.fetch_sub(entry.size as i64, Ordering::Relaxed);
    }

    pub fn batch_free(&self, entries: &[SpaceEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut lists = self.free_lists.lock();
        let mut released = 0i64;
        for entry in entries {
            if entry.is_empty() {
                continue;
            }
            lists.entry(entry.size).or_default().push(entry.offset);
            released += entry.size as i64;
        }
        drop(lists);
        self.allocated.fetch_sub(released, Ordering::Relaxed);
    }

    /// Translates an offset to an address, panicking on out-of-range input.
    /// Out-of-range offsets here are storage-format violations, not
    /// recoverable conditions.
    #[inline]
    pub fn offset2addr_checked(&self, offset: u64) -> *mut u8 {
        assert!(
            offset < self.capacity,
            "offset {} outside arena capacity {}",
            offset,
            self.capacity
        );
        // SAFETY: offset is within the single allocation owned by self.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// Translates an offset to an address, returning `None` for the null
    /// sentinel or out-of-range offsets.
    #[inline]
    pub fn offset2addr(&self, offset: u64) -> Option<*mut u8> {
        if offset < self.capacity {
            // SAFETY: bounds-checked above.
            Some(unsafe { self.base.as_ptr().add(offset as usize) })
        } else {
            None
        }
    }

    /// Translates an address previously derived from this arena back to its
    /// offset.
    #[inline]
    pub fn addr2offset_checked(&self, addr: *const u8) -> u64 {
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        assert!(addr >= base, "address below arena base");
        let offset = (addr - base) as u64;
        assert!(offset < self.capacity, "address outside arena");
        offset
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Net bytes currently allocated (reservations minus frees).
    pub fn bytes_allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base was allocated in new() with exactly this layout.
        unsafe {
            let layout =
                Layout::from_size_align_unchecked(self.capacity as usize, RECORD_ALIGN as usize);
            dealloc(self.base.as_ptr(), layout);
        }
    }
}
