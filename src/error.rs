//! # Error Types
//!
//! Domain errors surfaced by collection operations. Internal retry signals
//! (a doubly-linked-list splice losing a race) never appear here; write
//! paths retry them until they succeed. Infrastructure construction paths
//! (config validation, arena creation) use `eyre::Result` instead.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A lookup returned no live record.
    #[error("key not found")]
    NotFound,

    /// The arena could not serve the requested space; the operation had no
    /// observable effect.
    #[error("arena out of space")]
    MemoryOverflow,

    /// The caller passed a write descriptor bound to a different collection,
    /// or a timestamp that does not advance the key's version chain; no
    /// effect.
    #[error("invalid write arguments for this collection")]
    InvalidArgument,

    /// The user-supplied transformer passed to `modify` requested an abort.
    #[error("modify aborted by caller")]
    Aborted,

    /// A consistency audit detected an index or linkage mismatch.
    #[error("collection index corruption detected")]
    Corruption,
}
