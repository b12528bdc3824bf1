//! # Memory Module
//!
//! Offset-addressed arena allocation for record storage.
//!
//! ## Why Offsets Instead of Pointers?
//!
//! Records reference each other (list linkage, version chains) by 64-bit
//! byte offsets into a single arena rather than by raw addresses. Offsets
//! are stable for the arena's lifetime, fit in an atomic word, and survive
//! being stored inside the records themselves - the same property the
//! on-storage format of a persistent engine needs.
//!
//! ## Allocation Model
//!
//! The arena serves fixed 64-byte-aligned spans from segregated per-size
//! free lists, falling back to a bump pointer at the tail. Exhaustion is
//! signalled in-band: an allocation whose `size` is zero. Freed spans are
//! recycled by exact size class; the record sizing helper rounds every
//! request to the alignment, so classes stay dense.
//!
//! ```text
//! +--------------------------------------------------------------+
//! | rec | rec | rec |  free  | rec |   free   | rec |   ...tail  |
//! +--------------------------------------------------------------+
//!   ^ offsets are byte positions from the arena base, 64-aligned
//! ```
//!
//! ## Thread Safety
//!
//! `Arena` is `Send + Sync`. The bump tail is an atomic; free lists sit
//! behind a mutex. Callers hand out raw pointers derived from offsets; the
//! reclamation pipeline (see `version::cleaner`) guarantees no span is
//! recycled while a reader may still dereference it.

mod arena;

pub use arena::{Arena, SpaceEntry, NULL_OFFSET};
