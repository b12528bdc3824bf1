//! # Worker Identity
//!
//! Explicit worker handles indexing the cleaner's per-worker caches. A
//! worker registers once, passes its token into write operations, and the
//! slot is recycled when the token drops. Passing tokens explicitly keeps
//! the crate free of ambient thread-local state and lets embedders map
//! workers to whatever execution model they run.
//!
//! A token stands for one logical worker: it must not be used from two
//! threads at once. The lock order between a worker's cleaner cache and
//! the index bucket locks relies on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};

pub struct WorkerRegistry {
    slots: Box<[AtomicBool]>,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize) -> Self {
        assert!(max_workers > 0);
        Self {
            slots: (0..max_workers).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.slots.len()
    }

    /// Claims a free worker slot. Fails only when every slot is taken.
    pub fn register(self: &Arc<Self>) -> Result<WorkerToken> {
        for (id, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(WorkerToken {
                    id,
                    registry: Arc::clone(self),
                });
            }
        }
        bail!("too many registered workers (max {})", self.slots.len())
    }
}

/// RAII worker identity. The id indexes per-worker cleaner caches.
pub struct WorkerToken {
    id: usize,
    registry: Arc<WorkerRegistry>,
}

impl WorkerToken {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerToken {
    fn drop(&mut self) {
        self.registry.slots[self.id].store(false, Ordering::Release);
    }
}
