//! Hash Table Module
//!
//! The authoritative in-memory index of per-key state.
//!
//! ## Responsibilities
//! - At most one [`StoredValue`] per key
//! - Fine-grained locking: N buckets guarded by M striped locks
//! - Memory and item-count accounting kept equal to the sum over live entries
//! - Ejection of clean values (value-only) or whole entries (full eviction)
//! - Online resize and resumable traversal
//!
//! ## Lock Striping
//! ```text
//!  bucket:   0   1   2   3   4   5   6   7   8   9  10
//!  lock:     0   1   2   0   1   2   0   1   2   0   1     (bucket % locks)
//! ```
//! Every bucket with index `b` lives in stripe `b % locks` at position
//! `b / locks`. Resize takes every stripe lock in ascending order, so the
//! cost of a global operation is bounded by the number of locks.

mod stored_value;
mod table;

pub use stored_value::{
    StoredValue, TempState, INITIAL_NRU_VALUE, MAX_NRU_VALUE, MIN_NRU_VALUE,
};
pub use table::{HashBucketLock, HashTable, HashTableVisitor, Position};

/// What ejecting an item removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop the value, keep key and metadata resident
    ValueOnly,

    /// Remove the entry entirely; the backing store is the source of truth
    FullEviction,
}

/// Outcome of a hash table mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Key absent (CAS given for a key we do not have)
    NotFound,

    /// CAS did not match the stored value
    InvalidCas,

    /// Previous value was clean (or the key is new): caller must queue it
    WasClean,

    /// Previous value was already dirty: it is already queued
    WasDirty,

    /// Key may exist only on disk; fetch before deciding
    NeedBgFetch,
}

/// Outcome of adding a temporary placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTempStatus {
    /// Placeholder inserted
    Added,

    /// An entry (temporary or not) already exists for the key
    Exists,
}

/// Whether a lookup counts as an access for eviction ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReference {
    Yes,
    No,
}

/// Whether a lookup may return tombstones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantsDeleted {
    Yes,
    No,
}
