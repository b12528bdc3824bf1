//! # Configuration Constants
//!
//! All numeric defaults for hivekv in one place. Values that depend on each
//! other are documented together so they cannot silently drift apart.

/// Records and the arena bump pointer are aligned to this many bytes. The
/// record header is exactly one alignment unit, so a record's payload always
/// starts at `offset + RECORD_ALIGN`.
pub const RECORD_ALIGN: u64 = 64;

/// Default record arena capacity: 64 MiB.
pub const DEFAULT_ARENA_CAPACITY: u64 = 64 * 1024 * 1024;

/// An arena smaller than this cannot hold a header record plus one element
/// and is rejected at open.
pub const MIN_ARENA_CAPACITY: u64 = 4 * RECORD_ALIGN;

/// Hash-index shard count. Sixty-four shards keeps shard-lock contention
/// negligible for the worker counts we target (<= DEFAULT_MAX_WORKERS).
pub const DEFAULT_INDEX_SHARDS: usize = 64;

/// Stripes in the per-key write-lock table. Writers hold one of these for a
/// whole prepare+write cycle, so stripes must comfortably exceed the worker
/// count to keep false sharing rare.
pub const DEFAULT_KEY_LOCK_STRIPES: usize = 1024;

/// Stripes in the record link-lock table. Held only for a pointer-splice
/// critical section (a few loads and stores).
pub const DEFAULT_LINK_LOCK_STRIPES: usize = 1024;

/// Maximum concurrently registered workers. Bounds the cleaner's per-worker
/// cache array.
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Maximum concurrently held snapshots. Bounds the version controller's
/// slot array; the oldest-snapshot scan is O(this).
pub const DEFAULT_MAX_SNAPSHOTS: usize = 64;

/// Space entries batched during teardown walks before calling
/// `Arena::batch_free`.
pub const MAX_CACHED_OLD_RECORDS: usize = 10_000;

/// Worker-local cleaning refreshes the global oldest-snapshot floor once
/// per this many calls, amortizing the slot scan.
pub const UPDATE_SNAPSHOT_ROUND: usize = 10_000;

/// A full cleaner sweep drains a worker's cached old-delete records into
/// the global queue only past this backlog. Old-data records are always
/// drained. Delete records favor the worker-local fast path (their purge
/// touches the hash index under its bucket lock), but a bounded backlog
/// guarantees an idle worker cannot pin tombstones indefinitely.
pub const DEFAULT_DELETE_DRAIN_BACKLOG: usize = 4096;

const _: () = assert!(MIN_ARENA_CAPACITY >= 2 * RECORD_ALIGN);
const _: () = assert!(RECORD_ALIGN.is_power_of_two());
