//! concurrent-ref-hashmap: A segmented, thread-safe hash map whose values
//! are held through weak or soft references, so entries disappear once
//! nothing else needs them.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: a cache-style map that never keeps an unused value alive (weak)
//!   or keeps it only until memory pressure is signalled (soft), with
//!   writers on different segments never contending.
//! - Layers:
//!   - Reference / ReferenceManager: one reclaimable handle per entry and
//!     the per-segment lock-free queue of handles awaiting purge.
//!   - Segment: a `RwLock`ed bucket array over a generational slot arena;
//!     owns the count, the resize threshold and the restructure routine.
//!   - Task: the locked read-check-write body of every mutating operation.
//!   - ConcurrentReferenceHashMap<K, V, S>: public API; hashes, picks a
//!     segment from the high hash bits and delegates.
//!
//! Constraints
//! - `Send + Sync` whenever `K` and `V` are; values are shared as `Arc<V>`.
//! - Structural changes to a segment happen only under its exclusive lock;
//!   reads take the shared side.
//! - Stable, generational slot keys: stale keys left in a purge queue after
//!   a slot was freed or reused are detected and ignored.
//! - The segment count is fixed at construction. Bucket arrays only grow.
//!
//! Reclamation
//! - Weak: an entry is dead once the last external `Arc<V>` is dropped.
//! - Soft: the map owns an `Arc<V>`; `reclaim_soft_references` clears every
//!   value nobody else holds. There is no allocator feedback.
//! - Dead entries are invisible to lookups right away. They are queued for
//!   purging when a reader walks past them, when `purge_unreferenced_entries`
//!   sweeps, or when released by a task, and unlinked by the next restructure.
//! - `len()` therefore counts dead-but-unpurged entries too.
//!
//! Reentrancy policy
//! - User code runs under a segment lock in three places: `K: Eq` during
//!   chain walks, `V: PartialEq` in the conditional operations, and the
//!   constructor passed to `get_or_insert_with`. None of them may call back
//!   into the same map. A debug-only guard turns that deadlock into a panic.
//! - Purged keys and values are dropped after the lock is released, so
//!   their `Drop` may use the map.
//!
//! Notes and non-goals
//! - No null keys or values: absence is `Option`.
//! - Iteration is weakly consistent: never a duplicate, but entries added
//!   or removed concurrently may or may not be seen.
//! - No entry-set or key-set views beyond `iter()`.

mod config;
mod error;
mod iter;
mod map;
mod reentrancy;
mod reference;
mod segment;
mod task;

// Public surface
pub use config::{
    MapConfig, MapConfigBuilder, DEFAULT_CONCURRENCY_LEVEL, DEFAULT_INITIAL_CAPACITY,
    DEFAULT_LOAD_FACTOR, MAXIMUM_CONCURRENCY_LEVEL, MAXIMUM_SEGMENT_SIZE,
};
pub use error::{ConfigError, NoCurrentEntry};
pub use iter::Iter;
pub use map::ConcurrentReferenceHashMap;
pub use reference::ReferenceType;
