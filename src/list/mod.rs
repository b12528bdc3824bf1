//! # Doubly-Linked Record List
//!
//! The on-storage structure holding a collection's records: a circular
//! doubly-linked list threaded through record offsets, with the header
//! record as sentinel at both ends.
//!
//! ## Linkage Protocol
//!
//! Every record-to-record link is protected by a striped spinlock keyed by
//! record offset ([`LockTable`]). To splice between A and B, the writer
//! locks the relevant stripes in stripe order, re-verifies
//! `A.next == B && B.prev == A`, fully constructs the new record, and only
//! then publishes `A.next` followed by `B.prev`. Readers traversing
//! `next`/`prev` therefore observe either the old or the new linkage,
//! never a torn state.
//!
//! Unlinking runs the reverse publication order (`B.prev` first, then
//! `A.next`), mirroring insertion so a scan interrupted between the two
//! stores still finds a consistent forward chain.
//!
//! ## Conflicts
//!
//! A splice whose validation fails after lock acquisition lost a race: a
//! neighbor was replaced or the target was unlinked. The operation reports
//! a conflict and the caller re-resolves and retries; this is always
//! finite because every successful concurrent edit either advances the
//! target's timestamp or unlinks it, both of which the retry observes.

mod dl_list;
mod lock_table;

pub use dl_list::{DlList, OffsetIter, WriteArgs};
pub use lock_table::{LockTable, MultiGuard};
