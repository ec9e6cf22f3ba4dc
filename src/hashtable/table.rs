//! HashTable implementation
//!
//! Buckets are chains of [`StoredValue`]s. The bucket array is split into
//! stripes, one per lock; a stripe owns every bucket it guards, so holding
//! a stripe's mutex gives exclusive access to those chains.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::stored_value::{StoredValue, TempState};
use super::{AddTempStatus, EvictionPolicy, MutationStatus, TrackReference, WantsDeleted};
use crate::item::Item;
use crate::stats::EngineStats;
use crate::time::Clock;

/// Sizes picked by an automatic resize
const PRIME_SIZE_TABLE: [usize; 30] = [
    3, 7, 13, 23, 47, 97, 193, 383, 769, 1531, 3079, 6143, 12289, 24571, 49157, 98299,
    196613, 393241, 786433, 1572869, 3145739, 6291469, 12582917, 25165843, 50331653,
    100663319, 201326611, 402653189, 805306457, 1610612741,
];

/// Largest bucket count a table may be resized to
const MAX_TABLE_SIZE: usize = i32::MAX as usize;

/// Buckets guarded by one lock: bucket `b` lives here at index `b / locks`
struct Stripe {
    buckets: Vec<Vec<StoredValue>>,
}

impl Stripe {
    fn with_len(len: usize) -> Self {
        Self {
            buckets: std::iter::repeat_with(Vec::new).take(len).collect(),
        }
    }
}

/// Number of buckets stripe `stripe` holds in a table of `size` buckets
fn stripe_len(size: usize, locks: usize, stripe: usize) -> usize {
    if stripe >= size {
        0
    } else {
        (size - stripe + locks - 1) / locks
    }
}

fn hash_key(key: &[u8]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize
}

/// Exclusive hold on the bucket a key maps to
///
/// Obtained from [`HashTable::get_locked_bucket`] and passed to the
/// `unlocked_*` operations. Dropping it releases the lock.
pub struct HashBucketLock<'a> {
    guard: MutexGuard<'a, Stripe>,
    bucket_num: usize,
    slot: usize,
}

impl<'a> HashBucketLock<'a> {
    /// Index of the locked bucket
    pub fn bucket_num(&self) -> usize {
        self.bucket_num
    }

    fn chain(&self) -> &Vec<StoredValue> {
        &self.guard.buckets[self.slot]
    }

    fn chain_mut(&mut self) -> &mut Vec<StoredValue> {
        &mut self.guard.buckets[self.slot]
    }

    fn position_of(&self, key: &[u8]) -> Option<usize> {
        self.chain().iter().position(|v| v.key() == key)
    }
}

/// Where a paused traversal stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    /// Table size when the position was taken
    pub ht_size: usize,

    /// Next lock (stripe) to visit
    pub lock: usize,

    /// Next bucket to visit within that lock's stripe
    pub hash_bucket: usize,
}

/// Callback for [`HashTable::visit`] and [`HashTable::pause_resume_visit`]
pub trait HashTableVisitor {
    /// Visit one value; return false to pause the traversal
    fn visit(&mut self, bucket_num: usize, value: &mut StoredValue) -> bool;
}

/// Concurrent in-memory index of one partition's documents
pub struct HashTable {
    stripes: Vec<Mutex<Stripe>>,
    size: AtomicUsize,

    stats: Arc<EngineStats>,
    clock: Arc<dyn Clock>,
    eviction_policy: EvictionPolicy,

    num_items: AtomicUsize,
    num_deleted_items: AtomicUsize,
    num_non_resident_items: AtomicUsize,
    num_temp_items: AtomicUsize,
    mem_size: AtomicUsize,
    cache_size: AtomicUsize,
    num_resizes: AtomicUsize,

    max_cas: AtomicU64,
}

impl HashTable {
    /// Create a table of `size` buckets guarded by `locks` locks
    ///
    /// `locks` is clamped to `1..=size`.
    pub fn new(
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        size: usize,
        locks: usize,
        eviction_policy: EvictionPolicy,
    ) -> Self {
        let size = size.clamp(1, MAX_TABLE_SIZE);
        let locks = locks.clamp(1, size);
        let stripes = (0..locks)
            .map(|s| Mutex::new(Stripe::with_len(stripe_len(size, locks, s))))
            .collect();

        Self {
            stripes,
            size: AtomicUsize::new(size),
            stats,
            clock,
            eviction_policy,
            num_items: AtomicUsize::new(0),
            num_deleted_items: AtomicUsize::new(0),
            num_non_resident_items: AtomicUsize::new(0),
            num_temp_items: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            cache_size: AtomicUsize::new(0),
            num_resizes: AtomicUsize::new(0),
            max_cas: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Current number of buckets
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn num_locks(&self) -> usize {
        self.stripes.len()
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    /// Entries that are not temporary placeholders (tombstones included)
    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn num_deleted_items(&self) -> usize {
        self.num_deleted_items.load(Ordering::Relaxed)
    }

    /// Live entries whose value has been ejected
    pub fn num_non_resident_items(&self) -> usize {
        self.num_non_resident_items.load(Ordering::Relaxed)
    }

    pub fn num_temp_items(&self) -> usize {
        self.num_temp_items.load(Ordering::Relaxed)
    }

    /// Sum of `size()` over all entries
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// Sum of resident value bytes
    pub fn cache_size(&self) -> usize {
        self.cache_size.load(Ordering::Relaxed)
    }

    pub fn num_resizes(&self) -> usize {
        self.num_resizes.load(Ordering::Relaxed)
    }

    /// Highest CAS handed out or observed
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::SeqCst)
    }

    /// Make sure future CAS values are above `cas`
    pub fn observe_cas(&self, cas: u64) {
        self.max_cas.fetch_max(cas, Ordering::SeqCst);
    }

    fn next_cas(&self) -> u64 {
        self.max_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn account_add(&self, v: &StoredValue) {
        if v.is_temp_item() {
            self.num_temp_items.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_add(1, Ordering::Relaxed);
            if v.is_deleted() {
                self.num_deleted_items.fetch_add(1, Ordering::Relaxed);
            } else if !v.is_resident() {
                self.num_non_resident_items.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.mem_size.fetch_add(v.size(), Ordering::Relaxed);
        self.cache_size.fetch_add(v.value_size(), Ordering::Relaxed);
        self.stats.mem_add(v.size());
    }

    fn account_sub(&self, v: &StoredValue) {
        if v.is_temp_item() {
            self.num_temp_items.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_sub(1, Ordering::Relaxed);
            if v.is_deleted() {
                self.num_deleted_items.fetch_sub(1, Ordering::Relaxed);
            } else if !v.is_resident() {
                self.num_non_resident_items.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.mem_size.fetch_sub(v.size(), Ordering::Relaxed);
        self.cache_size.fetch_sub(v.value_size(), Ordering::Relaxed);
        self.stats.mem_sub(v.size());
    }

    /// Apply a size-affecting change to `v`, keeping the counters exact
    fn update<R>(&self, v: &mut StoredValue, f: impl FnOnce(&mut StoredValue) -> R) -> R {
        self.account_sub(v);
        let r = f(v);
        self.account_add(v);
        r
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Bucket index `key` maps to at the current size
    pub fn bucket_num(&self, key: &[u8]) -> usize {
        hash_key(key) % self.size()
    }

    /// Lock the bucket `key` maps to
    ///
    /// Retries if a resize completes between reading the size and taking
    /// the lock, so the returned bucket is always current.
    pub fn get_locked_bucket(&self, key: &[u8]) -> HashBucketLock<'_> {
        let hash = hash_key(key);
        let locks = self.num_locks();
        loop {
            let size = self.size();
            let bucket_num = hash % size;
            let guard = self.stripes[bucket_num % locks].lock();
            if size == self.size() {
                return HashBucketLock {
                    guard,
                    bucket_num,
                    slot: bucket_num / locks,
                };
            }
        }
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, Stripe>> {
        // Ascending order; every global operation takes them the same way
        self.stripes.iter().map(|s| s.lock()).collect()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Copy of the value stored for `key`
    pub fn find(
        &self,
        key: &[u8],
        track_reference: TrackReference,
        wants_deleted: WantsDeleted,
    ) -> Option<StoredValue> {
        let mut hbl = self.get_locked_bucket(key);
        self.unlocked_find(&mut hbl, key, wants_deleted, track_reference)
            .cloned()
    }

    /// Find `key` in an already locked bucket
    ///
    /// Temporary placeholders are returned; callers check their state.
    pub fn unlocked_find<'b>(
        &self,
        hbl: &'b mut HashBucketLock<'_>,
        key: &[u8],
        wants_deleted: WantsDeleted,
        track_reference: TrackReference,
    ) -> Option<&'b mut StoredValue> {
        let v = hbl.chain_mut().iter_mut().find(|v| v.key() == key)?;
        if v.is_deleted() && wants_deleted == WantsDeleted::No {
            return None;
        }
        if track_reference == TrackReference::Yes && !v.is_temp_item() {
            v.referenced();
        }
        Some(v)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Store `item`, honouring `item.cas` as the expected CAS (0 = any)
    pub fn set(&self, item: &Item) -> MutationStatus {
        let mut hbl = self.get_locked_bucket(&item.key);
        self.unlocked_set(&mut hbl, item)
    }

    /// Store `item` in a locked bucket, assigning a fresh CAS
    pub fn unlocked_set(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> MutationStatus {
        let now = self.clock.now();

        let Some(idx) = hbl.position_of(&item.key) else {
            if item.cas != 0 {
                return match self.eviction_policy {
                    EvictionPolicy::ValueOnly => MutationStatus::NotFound,
                    EvictionPolicy::FullEviction => MutationStatus::NeedBgFetch,
                };
            }
            let v = StoredValue::from_item(item, self.next_cas(), now);
            self.account_add(&v);
            hbl.chain_mut().push(v);
            return MutationStatus::WasClean;
        };

        let v = &mut hbl.chain_mut()[idx];
        if item.cas != 0 && item.cas != v.cas() {
            if v.is_temp_non_existent() || v.is_temp_deleted() {
                return MutationStatus::NotFound;
            }
            return MutationStatus::InvalidCas;
        }
        if item.cas != 0 && v.is_temp_initial() {
            return MutationStatus::NeedBgFetch;
        }

        let status = if v.is_dirty() {
            MutationStatus::WasDirty
        } else {
            MutationStatus::WasClean
        };
        let cas = self.next_cas();
        self.update(v, |v| v.set_from_item(item, cas, now));
        status
    }

    /// Remove `key` entirely
    pub fn del(&self, key: &[u8]) -> bool {
        let mut hbl = self.get_locked_bucket(key);
        self.unlocked_del(&mut hbl, key)
    }

    /// Remove `key` from a locked bucket
    pub fn unlocked_del(&self, hbl: &mut HashBucketLock<'_>, key: &[u8]) -> bool {
        self.unlocked_release(hbl, key).is_some()
    }

    /// Remove `key` from a locked bucket, handing ownership to the caller
    pub fn unlocked_release(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
    ) -> Option<StoredValue> {
        let idx = hbl.position_of(key)?;
        let v = hbl.chain_mut().swap_remove(idx);
        self.account_sub(&v);
        Some(v)
    }

    /// Turn `key` into a tombstone
    pub fn soft_delete(&self, key: &[u8], only_mark_deleted: bool) -> MutationStatus {
        let mut hbl = self.get_locked_bucket(key);
        self.unlocked_soft_delete(&mut hbl, key, only_mark_deleted)
    }

    /// Turn `key` into a tombstone in a locked bucket
    ///
    /// With `only_mark_deleted` the resident value is kept alongside the
    /// deleted flag; otherwise it is dropped.
    pub fn unlocked_soft_delete(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
        only_mark_deleted: bool,
    ) -> MutationStatus {
        let Some(idx) = hbl.position_of(key) else {
            return MutationStatus::NotFound;
        };
        let v = &mut hbl.chain_mut()[idx];
        if v.is_temp_item() || v.is_deleted() {
            return MutationStatus::NotFound;
        }
        let now = self.clock.now();
        let cas = self.next_cas();

        let status = if v.is_dirty() {
            MutationStatus::WasDirty
        } else {
            MutationStatus::WasClean
        };
        self.update(v, |v| {
            if !only_mark_deleted {
                v.value = None;
            }
            v.deleted = true;
            v.deleted_time = now;
            v.cas = cas;
            v.rev_seqno += 1;
            v.mark_dirty(now);
        });
        status
    }

    /// Eject `key`'s value (value-only) or the whole entry (full eviction)
    ///
    /// Refuses dirty, already ejected, deleted and temporary entries.
    pub fn unlocked_eject_item(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
        policy: EvictionPolicy,
    ) -> bool {
        let Some(idx) = hbl.position_of(key) else {
            return false;
        };
        let v = &mut hbl.chain_mut()[idx];
        if v.is_dirty() || !v.is_resident() || v.is_deleted() || v.is_temp_item() {
            return false;
        }

        match policy {
            EvictionPolicy::ValueOnly => {
                self.update(v, |v| v.value = None);
            }
            EvictionPolicy::FullEviction => {
                let v = hbl.chain_mut().swap_remove(idx);
                self.account_sub(&v);
            }
        }
        self.stats.num_value_ejects.increment();
        true
    }

    /// Insert a placeholder for a key about to be fetched from disk
    pub fn unlocked_add_temp_item(&self, hbl: &mut HashBucketLock<'_>, key: &[u8]) -> AddTempStatus {
        if hbl.position_of(key).is_some() {
            return AddTempStatus::Exists;
        }
        let v = StoredValue::temp_initial(key);
        self.account_add(&v);
        hbl.chain_mut().push(v);
        AddTempStatus::Added
    }

    /// Record that a fetched key is absent (or a tombstone) on disk
    pub fn unlocked_set_temp_state(
        &self,
        hbl: &mut HashBucketLock<'_>,
        key: &[u8],
        state: TempState,
    ) -> bool {
        let Some(idx) = hbl.position_of(key) else {
            return false;
        };
        let v = &mut hbl.chain_mut()[idx];
        if !v.is_temp_item() {
            return false;
        }
        self.update(v, |v| v.temp = Some(state));
        true
    }

    /// Put a fetched value back into a non-resident entry
    ///
    /// Only applies if the entry is still non-resident with the same CAS.
    pub fn unlocked_restore_value(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> bool {
        let Some(idx) = hbl.position_of(&item.key) else {
            return false;
        };
        let v = &mut hbl.chain_mut()[idx];
        if v.is_resident() || v.is_deleted() || v.is_temp_item() || v.cas() != item.cas {
            return false;
        }
        self.update(v, |v| v.value = item.value.clone());
        true
    }

    /// Install a persisted item as a clean entry
    ///
    /// Replaces a temporary placeholder or fills an absent slot; an existing
    /// real entry is newer than disk and is left alone.
    pub fn unlocked_restore_item(&self, hbl: &mut HashBucketLock<'_>, item: &Item) -> bool {
        self.observe_cas(item.cas);
        let restored = StoredValue::clean_from_item(item);
        match hbl.position_of(&item.key) {
            Some(idx) => {
                let v = &mut hbl.chain_mut()[idx];
                if !v.is_temp_item() {
                    return false;
                }
                self.update(v, |v| *v = restored);
            }
            None => {
                self.account_add(&restored);
                hbl.chain_mut().push(restored);
            }
        }
        true
    }

    /// Install a persisted item (warmup path)
    pub fn restore_item(&self, item: &Item) -> bool {
        let mut hbl = self.get_locked_bucket(&item.key);
        self.unlocked_restore_item(&mut hbl, item)
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut guards = self.lock_all();
        for guard in guards.iter_mut() {
            for chain in guard.buckets.iter_mut() {
                for v in chain.drain(..) {
                    self.account_sub(&v);
                }
            }
        }
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Resize to `new_size` buckets; 0 picks a size from the item count
    pub fn resize(&self, new_size: usize) {
        if new_size > MAX_TABLE_SIZE {
            warn!(
                requested = new_size,
                current = self.size(),
                "Refusing to resize hash table beyond i32::MAX buckets"
            );
            return;
        }
        let new_size = if new_size == 0 {
            self.preferred_size()
        } else {
            new_size
        };

        let locks = self.num_locks();
        if new_size < locks {
            debug!(new_size, locks, "Hash table resize below lock count skipped");
            return;
        }

        let mut guards = self.lock_all();
        let old_size = self.size();
        if new_size == old_size {
            return;
        }

        let mut values = Vec::with_capacity(self.num_items() + self.num_temp_items());
        for (s, guard) in guards.iter_mut().enumerate() {
            let old = std::mem::replace(
                &mut guard.buckets,
                Stripe::with_len(stripe_len(new_size, locks, s)).buckets,
            );
            values.extend(old.into_iter().flatten());
        }
        for v in values {
            let b = hash_key(v.key()) % new_size;
            guards[b % locks].buckets[b / locks].push(v);
        }

        self.size.store(new_size, Ordering::Release);
        self.num_resizes.fetch_add(1, Ordering::Relaxed);
        drop(guards);

        debug!(old_size, new_size, "Hash table resized");
    }

    /// Largest prime-table size not exceeding the item count
    fn preferred_size(&self) -> usize {
        let items = self.num_items();
        let idx = PRIME_SIZE_TABLE
            .iter()
            .position(|&p| items <= p)
            .unwrap_or(PRIME_SIZE_TABLE.len());
        if idx == 0 {
            PRIME_SIZE_TABLE[0]
        } else {
            PRIME_SIZE_TABLE[idx - 1]
        }
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Position at which a traversal is complete
    pub fn end_position(&self) -> Position {
        Position {
            ht_size: self.size(),
            lock: self.num_locks(),
            hash_bucket: 0,
        }
    }

    /// Visit every entry
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        let mut pos = Position::default();
        let end = self.end_position();
        while pos.lock < end.lock {
            pos = self.pause_resume_visit(visitor, pos);
        }
    }

    /// Visit entries starting at `start`, stopping when the visitor pauses
    ///
    /// Traversal is lock-major: every bucket of stripe 0, then stripe 1, and
    /// so on. A pause returns the position of the next unvisited bucket. If
    /// the table was resized since `start` was taken, the traversal restarts
    /// at the beginning of `start.lock`'s stripe.
    pub fn pause_resume_visit(
        &self,
        visitor: &mut dyn HashTableVisitor,
        start: Position,
    ) -> Position {
        let locks = self.num_locks();
        let mut lock = start.lock;
        let mut hash_bucket = start.hash_bucket;
        let mut size = self.size();

        while lock < locks {
            let mut guard = self.stripes[lock].lock();
            size = self.size();
            if size != start.ht_size || lock != start.lock {
                hash_bucket = lock;
            }

            while hash_bucket < size {
                let chain = &mut guard.buckets[hash_bucket / locks];
                for v in chain.iter_mut() {
                    if !visitor.visit(hash_bucket, v) {
                        return Position {
                            ht_size: size,
                            lock,
                            hash_bucket: hash_bucket + locks,
                        };
                    }
                }
                hash_bucket += locks;
            }
            lock += 1;
        }

        Position {
            ht_size: size,
            lock: locks,
            hash_bucket: 0,
        }
    }

    /// Report `(bucket_num, chain_depth, chain_bytes)` for every bucket
    pub fn visit_depth(&self, visitor: &mut dyn FnMut(usize, usize, usize)) {
        let locks = self.num_locks();
        for (s, stripe) in self.stripes.iter().enumerate() {
            let guard = stripe.lock();
            for (slot, chain) in guard.buckets.iter().enumerate() {
                let bytes = chain.iter().map(StoredValue::size).sum();
                visitor(slot * locks + s, chain.len(), bytes);
            }
        }
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        // Give the memory back to the engine-wide counter
        self.clear();
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("size", &self.size())
            .field("locks", &self.num_locks())
            .field("num_items", &self.num_items())
            .field("mem_size", &self.mem_size())
            .finish()
    }
}
