//! # Version Control
//!
//! Monotonic timestamps and snapshot tracking. Every write carries a
//! timestamp; every reader that needs a stable view holds a [`Snapshot`].
//! The floor of all live snapshots ("oldest snapshot timestamp") is the
//! gate the reclamation pipeline checks before freeing anything.
//!
//! ## Slot Array
//!
//! Active snapshots register in a fixed slot array:
//!
//! ```text
//! VersionController {
//!     next_ts:  AtomicU64,        // monotonic timestamp source
//!     slots:    [AtomicU64; N],   // 0 = free, else snapshot timestamp
//!     oldest:   AtomicU64,        // cached floor
//! }
//! ```
//!
//! Slot claim takes a small mutex; release is a single store in `Drop`.
//! Computing the floor is a lock-free O(N) scan, cached in `oldest` so hot
//! paths read one atomic. The cache is refreshed explicitly
//! (`update_oldest_snapshot`) because the scan is only needed when the
//! cleaner wants fresher eligibility bounds.
//!
//! ## External Timestamps
//!
//! Callers may assign their own (engine-issued) timestamps to writes. The
//! controller observes them (`observe`) so its clock never falls behind a
//! timestamp it has been shown; the floor computation stays correct with
//! mixed internal/external stamps.

pub mod cleaner;

pub use cleaner::{OldDataRecord, OldDeleteRecord, OldRecordsCleaner};

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, Result};
use parking_lot::Mutex;

const FREE_SLOT: u64 = 0;

pub struct VersionController {
    next_ts: AtomicU64,
    slots: Box<[AtomicU64]>,
    oldest: AtomicU64,
    slot_lock: Mutex<()>,
}

impl VersionController {
    pub fn new(max_snapshots: usize) -> Self {
        assert!(max_snapshots > 0);
        Self {
            next_ts: AtomicU64::new(1),
            slots: (0..max_snapshots).map(|_| AtomicU64::new(FREE_SLOT)).collect(),
            oldest: AtomicU64::new(1),
            slot_lock: Mutex::new(()),
        }
    }

    /// Issues the next timestamp. Strictly monotonic across all callers.
    #[inline]
    pub fn new_timestamp(&self) -> u64 {
        self.next_ts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The latest timestamp issued or observed.
    #[inline]
    pub fn current_timestamp(&self) -> u64 {
        self.next_ts.load(Ordering::SeqCst)
    }

    /// Advances the clock to at least `ts`. Called with externally assigned
    /// write timestamps so the snapshot floor can never run ahead of them.
    #[inline]
    pub fn observe(&self, ts: u64) {
        self.next_ts.fetch_max(ts, Ordering::SeqCst);
    }

    /// Registers a snapshot at the current timestamp. Fails only when every
    /// slot is taken.
    pub fn hold_snapshot(&self) -> Result<Snapshot<'_>> {
        let _guard = self.slot_lock.lock();
        let ts = self.current_timestamp();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == FREE_SLOT {
                slot.store(ts, Ordering::SeqCst);
                return Ok(Snapshot {
                    controller: self,
                    slot: idx,
                    ts,
                });
            }
        }
        bail!("too many concurrent snapshots (max {})", self.slots.len())
    }

    /// Recomputes the snapshot floor into the cache. The floor is the
    /// minimum over live snapshot timestamps, or the current timestamp when
    /// none are held. Monotone: a concurrent stale recompute cannot move it
    /// backwards.
    pub fn update_oldest_snapshot(&self) {
        let mut min_ts = self.current_timestamp();
        for slot in self.slots.iter() {
            let ts = slot.load(Ordering::SeqCst);
            if ts != FREE_SLOT && ts < min_ts {
                min_ts = ts;
            }
        }
        self.oldest.fetch_max(min_ts, Ordering::SeqCst);
    }

    /// Cached floor of all live snapshots.
    #[inline]
    pub fn oldest_snapshot_ts(&self) -> u64 {
        self.oldest.load(Ordering::SeqCst)
    }
}

/// RAII registration of one read snapshot. While alive, nothing written at
/// or before `ts()` that this snapshot could observe will be reclaimed.
pub struct Snapshot<'a> {
    controller: &'a VersionController,
    slot: usize,
    ts: u64,
}

impl Snapshot<'_> {
    #[inline]
    pub fn ts(&self) -> u64 {
        self.ts
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        self.controller.slots[self.slot].store(FREE_SLOT, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_monotonic() {
        let vc = VersionController::new(4);
        let a = vc.new_timestamp();
        let b = vc.new_timestamp();
        assert!(b > a);
    }

    #[test]
    fn observe_never_moves_clock_backwards() {
        let vc = VersionController::new(4);
        vc.observe(100);
        assert_eq!(vc.current_timestamp(), 100);
        vc.observe(50);
        assert_eq!(vc.current_timestamp(), 100);
        assert!(vc.new_timestamp() > 100);
    }

    #[test]
    fn oldest_floor_tracks_live_snapshots() {
        let vc = VersionController::new(4);
        vc.observe(10);
        let snap = vc.hold_snapshot().unwrap();
        assert_eq!(snap.ts(), 10);

        vc.observe(50);
        vc.update_oldest_snapshot();
        assert_eq!(vc.oldest_snapshot_ts(), 10);

        drop(snap);
        vc.update_oldest_snapshot();
        assert_eq!(vc.oldest_snapshot_ts(), 50);
    }

    #[test]
    fn floor_is_monotone() {
        let vc = VersionController::new(4);
        vc.observe(30);
        vc.update_oldest_snapshot();
        assert_eq!(vc.oldest_snapshot_ts(), 30);
        // a floor can never regress even if recomputed with fewer inputs
        vc.update_oldest_snapshot();
        assert!(vc.oldest_snapshot_ts() >= 30);
    }

    #[test]
    fn snapshot_slots_exhaust_and_recycle() {
        let vc = VersionController::new(2);
        let a = vc.hold_snapshot().unwrap();
        let _b = vc.hold_snapshot().unwrap();
        assert!(vc.hold_snapshot().is_err());
        drop(a);
        assert!(vc.hold_snapshot().is_ok());
    }
}
