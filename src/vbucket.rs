//! VBucket Module
//!
//! A vbucket is one partition of the key space: a [`HashTable`] plus the
//! sequence numbers and failover history that describe its mutations.
//!
//! ## Responsibilities
//! - Assign a `by_seqno` to every successful mutation
//! - Queue a key on its shard's [`DirtyQueue`] on the clean → dirty edge
//! - Produce the [`VBucketState`] persisted by snapshots
//!
//! ```text
//!   set/del ──► bucket lock ──► mutate StoredValue ──► seqno++
//!                                       │
//!                     was clean? ───────┴──► DirtyQueue::push (after unlock)
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::flusher::DirtyQueue;
use crate::hashtable::{EvictionPolicy, HashTable, MutationStatus, TrackReference, WantsDeleted};
use crate::item::Item;
use crate::kvstore::{FailoverEntry, VBucketState, VBucketStateKind};
use crate::stats::EngineStats;
use crate::time::Clock;

/// Failover entries kept per vbucket
const MAX_FAILOVER_ENTRIES: usize = 25;

/// One partition of the key space
pub struct VBucket {
    id: u16,
    state: RwLock<VBucketStateKind>,
    pub ht: HashTable,

    high_seqno: AtomicU64,
    persisted_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    max_deleted_seqno: AtomicU64,
    failover_log: Mutex<Vec<FailoverEntry>>,

    dirty_queue: Arc<DirtyQueue>,
    clock: Arc<dyn Clock>,
}

impl VBucket {
    /// Create an empty vbucket with a fresh failover entry
    pub fn new(
        id: u16,
        state: VBucketStateKind,
        config: &Config,
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        dirty_queue: Arc<DirtyQueue>,
    ) -> Self {
        let vb = Self::build(id, state, config, stats, clock, dirty_queue);
        vb.create_failover_entry(0);
        vb
    }

    /// Recreate a vbucket from its persisted state
    pub fn from_persisted(
        id: u16,
        persisted: &VBucketState,
        config: &Config,
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        dirty_queue: Arc<DirtyQueue>,
    ) -> Self {
        let vb = Self::build(id, persisted.state, config, stats, clock, dirty_queue);
        vb.high_seqno.store(persisted.high_seqno, Ordering::Release);
        vb.persisted_seqno.store(persisted.high_seqno, Ordering::Release);
        vb.purge_seqno.store(persisted.purge_seqno, Ordering::Release);
        vb.max_deleted_seqno
            .store(persisted.max_deleted_seqno, Ordering::Release);
        vb.ht.observe_cas(persisted.max_cas);
        *vb.failover_log.lock() = persisted.failover_log.clone();
        if persisted.failover_log.is_empty() {
            vb.create_failover_entry(persisted.high_seqno);
        }
        vb
    }

    fn build(
        id: u16,
        state: VBucketStateKind,
        config: &Config,
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        dirty_queue: Arc<DirtyQueue>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            ht: HashTable::new(
                stats,
                clock.clone(),
                config.ht_size,
                config.ht_locks,
                config.eviction_policy,
            ),
            high_seqno: AtomicU64::new(0),
            persisted_seqno: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(0),
            max_deleted_seqno: AtomicU64::new(0),
            failover_log: Mutex::new(Vec::new()),
            dirty_queue,
            clock,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketStateKind {
        *self.state.read()
    }

    /// Change role; returns the previous one
    pub fn set_state(&self, state: VBucketStateKind) -> VBucketStateKind {
        std::mem::replace(&mut *self.state.write(), state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == VBucketStateKind::Active
    }

    // =========================================================================
    // Sequence numbers
    // =========================================================================

    pub fn high_seqno(&self) -> u64 {
        self.high_seqno.load(Ordering::Acquire)
    }

    /// Highest seqno known to be durable
    pub fn persisted_seqno(&self) -> u64 {
        self.persisted_seqno.load(Ordering::Acquire)
    }

    pub fn purge_seqno(&self) -> u64 {
        self.purge_seqno.load(Ordering::Acquire)
    }

    fn next_seqno(&self) -> u64 {
        self.high_seqno.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raise the high seqno (warmup, rollback)
    pub fn set_high_seqno(&self, seqno: u64) {
        self.high_seqno.store(seqno, Ordering::Release);
    }

    pub(crate) fn note_persisted(&self, seqno: u64) {
        self.persisted_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    pub(crate) fn note_purged(&self, seqno: u64) {
        self.purge_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Reset seqnos after the vbucket's contents were discarded
    pub(crate) fn reset_seqnos(&self, seqno: u64) {
        self.high_seqno.store(seqno, Ordering::Release);
        self.persisted_seqno.store(seqno, Ordering::Release);
    }

    // =========================================================================
    // Failover log
    // =========================================================================

    /// Newest entry first
    pub fn failover_log(&self) -> Vec<FailoverEntry> {
        self.failover_log.lock().clone()
    }

    /// Start a new history branch at `seqno`
    pub fn create_failover_entry(&self, seqno: u64) -> FailoverEntry {
        let entry = FailoverEntry {
            vb_uuid: self.generate_uuid(seqno),
            by_seqno: seqno,
        };
        let mut log = self.failover_log.lock();
        log.insert(0, entry);
        log.truncate(MAX_FAILOVER_ENTRIES);
        entry
    }

    fn generate_uuid(&self, seqno: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        seqno.hash(&mut hasher);
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
            .hash(&mut hasher);
        hasher.finish().max(1)
    }

    /// State to hand to [`crate::kvstore::KvStore::snapshot_vbucket`]
    pub fn persisted_state(&self) -> VBucketState {
        VBucketState {
            state: self.state(),
            checkpoint_id: 0,
            max_deleted_seqno: self.max_deleted_seqno.load(Ordering::Acquire),
            high_seqno: self.persisted_seqno(),
            purge_seqno: self.purge_seqno(),
            max_cas: self.ht.max_cas(),
            failover_log: self.failover_log(),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Store `item`, honouring its CAS, and queue it for persistence
    pub fn set(&self, item: &Item) -> MutationStatus {
        let status = {
            let mut hbl = self.ht.get_locked_bucket(&item.key);
            let status = self.ht.unlocked_set(&mut hbl, item);
            if matches!(status, MutationStatus::WasClean | MutationStatus::WasDirty) {
                let seqno = self.next_seqno();
                if let Some(v) =
                    self.ht
                        .unlocked_find(&mut hbl, &item.key, WantsDeleted::Yes, TrackReference::No)
                {
                    v.by_seqno = seqno;
                }
            }
            status
        };

        if status == MutationStatus::WasClean {
            self.dirty_queue.push(self.id, &item.key, self.clock.now());
        }
        status
    }

    /// Tombstone `key`; `cas` of 0 matches any version
    pub fn soft_delete(&self, key: &[u8], cas: u64) -> MutationStatus {
        let status = {
            let mut hbl = self.ht.get_locked_bucket(key);
            let current = self
                .ht
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                .map(|v| (v.cas(), v.is_temp_initial(), v.is_deleted() || v.is_temp_item()));
            match current {
                None => {
                    return match self.ht.eviction_policy() {
                        EvictionPolicy::ValueOnly => MutationStatus::NotFound,
                        EvictionPolicy::FullEviction => MutationStatus::NeedBgFetch,
                    };
                }
                Some((_, true, _)) => return MutationStatus::NeedBgFetch,
                Some((_, _, true)) => return MutationStatus::NotFound,
                Some((current_cas, _, _)) if cas != 0 && cas != current_cas => {
                    return MutationStatus::InvalidCas;
                }
                Some(_) => {}
            }

            let status = self.ht.unlocked_soft_delete(&mut hbl, key, false);
            if matches!(status, MutationStatus::WasClean | MutationStatus::WasDirty) {
                let seqno = self.next_seqno();
                self.max_deleted_seqno.fetch_max(seqno, Ordering::AcqRel);
                if let Some(v) =
                    self.ht
                        .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                {
                    v.by_seqno = seqno;
                }
            }
            status
        };

        if status == MutationStatus::WasClean {
            self.dirty_queue.push(self.id, key, self.clock.now());
        }
        status
    }

    /// Delete an item found expired, unless it changed since it was read
    pub fn delete_expired(&self, item: &Item) -> bool {
        let unchanged = self
            .ht
            .find(&item.key, TrackReference::No, WantsDeleted::No)
            .map_or(true, |v| v.cas() == item.cas && !v.is_temp_item());
        if !unchanged {
            return false;
        }
        let in_memory = self
            .ht
            .find(&item.key, TrackReference::No, WantsDeleted::Yes)
            .is_some();
        if !in_memory {
            // Only on disk once ejected under full eviction
            if self.ht.eviction_policy() != EvictionPolicy::FullEviction {
                return false;
            }
            return self.insert_tombstone(&item.key);
        }
        matches!(
            self.soft_delete(&item.key, item.cas),
            MutationStatus::WasClean | MutationStatus::WasDirty
        )
    }

    fn insert_tombstone(&self, key: &[u8]) -> bool {
        {
            let mut hbl = self.ht.get_locked_bucket(key);
            if self
                .ht
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                .is_some()
            {
                return false;
            }
            self.ht.unlocked_set(&mut hbl, &Item::new(key.to_vec(), Vec::new()));
            self.ht.unlocked_soft_delete(&mut hbl, key, false);
            let seqno = self.next_seqno();
            self.max_deleted_seqno.fetch_max(seqno, Ordering::AcqRel);
            if let Some(v) = self
                .ht
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
            {
                v.by_seqno = seqno;
            }
        }
        self.dirty_queue.push(self.id, key, self.clock.now());
        true
    }
}

impl std::fmt::Debug for VBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBucket")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("high_seqno", &self.high_seqno())
            .field("num_items", &self.ht.num_items())
            .finish()
    }
}

// =============================================================================
// VBucketMap
// =============================================================================

/// Fixed-size table of the vbuckets hosted on this node
pub struct VBucketMap {
    slots: Vec<RwLock<Option<Arc<VBucket>>>>,
}

impl VBucketMap {
    pub fn new(max_vbuckets: u16) -> Self {
        Self {
            slots: (0..max_vbuckets).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.slots.get(vbid as usize)?.read().clone()
    }

    /// Install `vb`, returning whatever was there; false if out of range
    pub fn insert(&self, vb: Arc<VBucket>) -> Option<Arc<VBucket>> {
        let slot = self.slots.get(vb.id() as usize)?;
        slot.write().replace(vb)
    }

    pub fn remove(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.slots.get(vbid as usize)?.write().take()
    }

    /// Every hosted vbucket, in vbid order
    pub fn all(&self) -> Vec<Arc<VBucket>> {
        self.slots.iter().filter_map(|s| s.read().clone()).collect()
    }

    /// Hosted vbuckets belonging to `shard` of `shards`
    pub fn for_shard(&self, shard: u16, shards: u16) -> Vec<Arc<VBucket>> {
        self.all()
            .into_iter()
            .filter(|vb| vb.id() % shards.max(1) == shard)
            .collect()
    }
}
