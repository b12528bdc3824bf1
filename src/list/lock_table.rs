//! Striped lock table keyed by record offset.
//!
//! Holds the per-record link locks of the splice protocol. Stripe count is
//! fixed at construction; two offsets hashing to the same stripe share a
//! lock, which is harmless for correctness and rare enough at the default
//! stripe count not to matter for throughput.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};

pub struct LockTable {
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

/// Guard over one or two stripes, released together.
pub struct MultiGuard<'a> {
    _first: MutexGuard<'a, ()>,
    _second: Option<MutexGuard<'a, ()>>,
}

impl LockTable {
    pub fn new(stripe_count: usize) -> Self {
        assert!(stripe_count.is_power_of_two());
        Self {
            stripes: (0..stripe_count).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn stripe_of(&self, offset: u64) -> usize {
        let mut h = self.hasher.build_hasher();
        offset.hash(&mut h);
        (h.finish() as usize) & (self.stripes.len() - 1)
    }

    /// Locks the stripe guarding `offset`.
    pub fn lock(&self, offset: u64) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(offset)].lock()
    }

    /// Locks the stripes guarding both offsets, in stripe order, taking a
    /// single lock when they collide. Stripe-ordered acquisition makes
    /// concurrent multi-locks deadlock-free.
    pub fn multi_lock(&self, a: u64, b: u64) -> MultiGuard<'_> {
        let (sa, sb) = (self.stripe_of(a), self.stripe_of(b));
        if sa == sb {
            MultiGuard {
                _first: self.stripes[sa].lock(),
                _second: None,
            }
        } else {
            let (lo, hi) = if sa < sb { (sa, sb) } else { (sb, sa) };
            let first = self.stripes[lo].lock();
            let second = self.stripes[hi].lock();
            MultiGuard {
                _first: first,
                _second: Some(second),
            }
        }
    }
}
