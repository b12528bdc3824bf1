//! # hivekv - Multi-Version Hash Collection Storage Core
//!
//! hivekv is the hash-collection storage core of a persistent key-value
//! engine: a named, mutable mapping from byte-string sub-keys to byte-string
//! values, backed by a concurrent, multi-version record engine. Lock-free
//! readers race with writers and background cleaners; superseded records are
//! reclaimed in two timestamp-gated stages so that no reader ever
//! dereferences recycled memory.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hivekv::{Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::default())?;
//! let worker = store.register_worker()?;
//! let coll = store.create_collection("profiles")?;
//!
//! coll.put(&worker, b"alice", b"v1", store.new_timestamp())?;
//! assert_eq!(coll.get(b"alice")?, b"v1");
//! coll.delete(&worker, b"alice", store.new_timestamp())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       HashList (collection façade)      │
//! ├────────────────────┬────────────────────┤
//! │  HashIndex         │ DlList + LockTable │
//! │  (key → record)    │ (record linkage)   │
//! ├────────────────────┴────────────────────┤
//! │  Record (64-byte header + payload)      │
//! ├─────────────────────────────────────────┤
//! │  Arena (offset-addressed memory)        │
//! ├─────────────────────────────────────────┤
//! │  VersionController + OldRecordsCleaner  │
//! │  (snapshots, deferred reclamation)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Record Lifecycle
//!
//! Every write constructs a brand-new record; nothing is updated in place
//! except the doubly-linked-list pointers. A record moves through
//! `Constructed -> Linked -> Retired -> Freed`:
//!
//! - **Constructed**: written into freshly reserved arena space, invisible.
//! - **Linked**: spliced into the collection's circular list and published
//!   through the hash index.
//! - **Retired**: superseded by a newer version (or tombstoned); handed to
//!   the cleaner together with the superseding writer's timestamp.
//! - **Freed**: space returned to the arena once no live snapshot predates
//!   the retirement, then gated once more before reuse so stale raw
//!   pointers held by in-flight readers stay dereferenceable.
//!
//! ## Module Overview
//!
//! - [`memory`]: offset-addressed arena allocator
//! - [`records`]: on-storage record layout and helpers
//! - [`list`]: circular doubly-linked record list with atomic linkage
//! - [`index`]: sharded hash index mapping internal keys to records
//! - [`version`]: timestamps, snapshots, and the old-records cleaner
//! - [`collection`]: the `HashList` collection façade
//! - [`workers`]: explicit worker identity for per-worker cleaner caches

#[macro_use]
mod macros;

pub mod collection;
pub mod config;
pub mod error;
pub mod index;
pub mod list;
pub mod memory;
pub mod records;
pub mod store;
pub mod version;
pub mod workers;

pub use collection::{HashList, HashWriteArgs, ModifyOp, WriteOp, WriteResult};
pub use config::StoreConfig;
pub use error::StoreError;
pub use store::Store;
pub use workers::WorkerToken;
