//! Engine Module
//!
//! The storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Route each request to its vbucket and the vbucket's shard
//! - Enforce the memory quota and vbucket state before mutating
//! - Own the executor and every background task
//! - Warm the hash tables up from disk on startup
//!
//! ## Shards
//! ```text
//!   vbid % max_num_shards ──► Shard { KvStore, DirtyQueue, Flusher, BgFetcher }
//! ```
//! Each shard has its own backing store and queue, so one shard's slow
//! disk never stalls another's flusher.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bgfetcher::{BgFetcher, BgFetcherTask, FetchCompletion, IDLE_SLEEP};
use crate::config::Config;
use crate::error::{EpError, Result};
use crate::executor::{ExecutorPool, GlobalTask, Priority, TaskId};
use crate::flusher::{DirtyQueue, Flusher, FlusherState};
use crate::hashtable::{AddTempStatus, EvictionPolicy, MutationStatus, TrackReference, WantsDeleted};
use crate::item::{EngineStatus, Item};
use crate::kvstore::{
    CacheLookup, CacheLookupKey, CompactionCtx, DocumentFilter, FileKvStore, FileKvStoreConfig,
    GetValue, KvStore, RollbackResult, ScanControl, ScanStatus, ValueFilter, VBucketState,
    VBucketStateKind,
};
use crate::stats::EngineStats;
use crate::tasks::{
    compact_vbucket, snapshot_shard, CompactVBucketTask, CompactionConfig, ItemPager,
    VBDeleteTask, VBSnapshotTask,
};
use crate::time::{Clock, SystemClock};
use crate::vbucket::{VBucket, VBucketMap};

/// Everything owned by one storage shard
struct Shard {
    id: u16,
    store: Arc<dyn KvStore>,
    queue: Arc<DirtyQueue>,
    flusher: Arc<Flusher>,
    bg_fetcher: Arc<BgFetcher>,
}

/// Outcome of looking a key up under its bucket lock
enum Lookup {
    Found(Item),
    NotFound,
    Fetch,
    Expired(u64),
}

/// The eventually-persistent store
///
/// Reads and writes go to the hash tables; persistence, fetching from disk
/// and maintenance run on the executor.
pub struct EpStore {
    config: Config,
    stats: Arc<EngineStats>,
    clock: Arc<dyn Clock>,
    vbuckets: Arc<VBucketMap>,
    shards: Vec<Shard>,
    pool: ExecutorPool,
    pager_task: Mutex<Option<TaskId>>,
    shutdown: AtomicBool,
}

impl EpStore {
    /// Open or create a store in `config.data_dir`
    ///
    /// On startup:
    /// 1. Open one file store per shard
    /// 2. Warm up every persisted vbucket
    /// 3. Start flushers, background fetchers and the item pager
    pub fn open(config: Config) -> Result<Self> {
        Self::validate(&config)?;
        let mut stores: Vec<Arc<dyn KvStore>> = Vec::with_capacity(config.max_num_shards as usize);
        for shard in 0..config.max_num_shards {
            let store = FileKvStore::open(FileKvStoreConfig::from_config(&config, shard))?;
            stores.push(Arc::new(store));
        }
        Self::open_with(config, SystemClock::shared(), stores)
    }

    /// Open with explicit stores (one per shard) and clock
    pub fn open_with(
        config: Config,
        clock: Arc<dyn Clock>,
        stores: Vec<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        Self::validate(&config)?;
        if stores.len() != config.max_num_shards as usize {
            return Err(EpError::Config(format!(
                "expected {} stores, got {}",
                config.max_num_shards,
                stores.len()
            )));
        }

        let stats = Arc::new(EngineStats::new());
        let vbuckets = Arc::new(VBucketMap::new(config.max_vbuckets));

        let shards = stores
            .into_iter()
            .enumerate()
            .map(|(id, store)| {
                let id = id as u16;
                let queue = Arc::new(DirtyQueue::new(stats.clone()));
                let flusher = Arc::new(Flusher::new(
                    id,
                    store.clone(),
                    vbuckets.clone(),
                    queue.clone(),
                    stats.clone(),
                    clock.clone(),
                    &config,
                ));
                let bg_fetcher = Arc::new(BgFetcher::new(
                    id,
                    store.clone(),
                    vbuckets.clone(),
                    stats.clone(),
                    config.eviction_policy,
                    config.bg_fetch_delay,
                ));
                Shard {
                    id,
                    store,
                    queue,
                    flusher,
                    bg_fetcher,
                }
            })
            .collect();

        let pool = ExecutorPool::new(config.num_workers);
        let store = Self {
            config,
            stats,
            clock,
            vbuckets,
            shards,
            pool,
            pager_task: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        };

        store.warmup()?;
        store.start_tasks();
        info!(
            data_dir = %store.config.data_dir.display(),
            shards = store.shards.len(),
            vbuckets = store.vbuckets.all().len(),
            "Store opened"
        );
        Ok(store)
    }

    /// Background work is gone once shut down
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EpError::Shutdown);
        }
        Ok(())
    }

    fn validate(config: &Config) -> Result<()> {
        if config.max_num_shards == 0 {
            return Err(EpError::Config("max_num_shards must be at least 1".into()));
        }
        if config.max_vbuckets == 0 {
            return Err(EpError::Config("max_vbuckets must be at least 1".into()));
        }
        if config.ht_size == 0 || config.ht_locks == 0 {
            return Err(EpError::Config("ht_size and ht_locks must be non-zero".into()));
        }
        if config.mem_low_wat > config.mem_high_wat {
            return Err(EpError::Config("mem_low_wat is above mem_high_wat".into()));
        }
        Ok(())
    }

    fn start_tasks(&self) {
        for shard in &self.shards {
            shard.flusher.start(&self.pool);
            let task = GlobalTask::new(
                BgFetcherTask::new(shard.bg_fetcher.clone()),
                Priority::BG_FETCHER,
                IDLE_SLEEP,
                false,
            );
            shard.bg_fetcher.set_task_id(self.pool.schedule(task));
        }

        let pager = ItemPager::new(
            self.vbuckets.clone(),
            self.stats.clone(),
            self.config.eviction_policy,
            self.config.mem_low_wat,
            self.config.mem_high_wat,
            self.config.pager_sleep,
        );
        let task = GlobalTask::new(pager, Priority::ITEM_PAGER, self.config.pager_sleep, false);
        *self.pager_task.lock() = Some(self.pool.schedule(task));
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid)
    }

    /// Backing store serving `vbid`
    pub fn kvstore(&self, vbid: u16) -> &Arc<dyn KvStore> {
        &self.shard_of(vbid).store
    }

    pub fn flusher(&self, vbid: u16) -> &Arc<Flusher> {
        &self.shard_of(vbid).flusher
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    fn shard_of(&self, vbid: u16) -> &Shard {
        &self.shards[self.config.shard_of(vbid) as usize]
    }

    fn active_vbucket(&self, vbid: u16) -> std::result::Result<Arc<VBucket>, EngineStatus> {
        match self.vbuckets.get(vbid) {
            Some(vb) if vb.is_active() => Ok(vb),
            _ => {
                self.stats.num_not_my_vbuckets.increment();
                Err(EngineStatus::NotMyVbucket)
            }
        }
    }

    fn has_memory_for(&self, item: &Item) -> bool {
        let needed = item.key.len() + item.value_len();
        self.stats.mem_used().saturating_add(needed) <= self.config.max_size
    }

    // =========================================================================
    // Front-end operations
    // =========================================================================

    /// Store `item` in its vbucket; `item.cas` of 0 matches any version
    pub fn set(&self, item: &Item) -> EngineStatus {
        let vb = match self.active_vbucket(item.vbid) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        if !self.has_memory_for(item) {
            self.stats.tmp_oom_errors.increment();
            return EngineStatus::NoMemory;
        }

        match vb.set(item) {
            MutationStatus::WasClean | MutationStatus::WasDirty => EngineStatus::Success,
            MutationStatus::InvalidCas => EngineStatus::KeyExists,
            MutationStatus::NotFound => EngineStatus::KeyNotFound,
            MutationStatus::NeedBgFetch => self.fetch_for_mutation(&vb, &item.key),
        }
    }

    /// Delete `key`; `cas` of 0 matches any version
    pub fn del(&self, vbid: u16, key: &[u8], cas: u64) -> EngineStatus {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        match vb.soft_delete(key, cas) {
            MutationStatus::WasClean | MutationStatus::WasDirty => EngineStatus::Success,
            MutationStatus::InvalidCas => EngineStatus::KeyExists,
            MutationStatus::NotFound => EngineStatus::KeyNotFound,
            MutationStatus::NeedBgFetch => self.fetch_for_mutation(&vb, key),
        }
    }

    /// Look `key` up without waiting for disk
    pub fn get(&self, vbid: u16, key: &[u8]) -> GetValue {
        self.get_with_waiter(vbid, key, None)
    }

    /// Look `key` up; on `WouldBlock`, `waiter` is told when the fetch ends
    pub fn get_with_waiter(
        &self,
        vbid: u16,
        key: &[u8],
        waiter: Option<FetchCompletion>,
    ) -> GetValue {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => {
                return GetValue {
                    status,
                    item: None,
                }
            }
        };

        let now = self.clock.now();
        let lookup = {
            let mut hbl = vb.ht.get_locked_bucket(key);
            let found = vb
                .ht
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::Yes);
            match found {
                Some(v) if v.is_temp_initial() => Lookup::Fetch,
                Some(v) if v.is_temp_item() || v.is_deleted() => Lookup::NotFound,
                Some(v) if v.expiry() != 0 && v.expiry() < now => Lookup::Expired(v.cas()),
                Some(v) if !v.is_resident() => Lookup::Fetch,
                Some(v) => Lookup::Found(v.to_item(vbid)),
                None => match self.config.eviction_policy {
                    EvictionPolicy::ValueOnly => Lookup::NotFound,
                    EvictionPolicy::FullEviction => {
                        vb.ht.unlocked_add_temp_item(&mut hbl, key);
                        Lookup::Fetch
                    }
                },
            }
        };

        match lookup {
            Lookup::Found(item) => GetValue::found(item),
            Lookup::NotFound => GetValue::not_found(),
            Lookup::Expired(cas) => {
                vb.soft_delete(key, cas);
                GetValue::not_found()
            }
            Lookup::Fetch => {
                self.queue_bg_fetch(&vb, key, waiter);
                GetValue {
                    status: EngineStatus::WouldBlock,
                    item: None,
                }
            }
        }
    }

    /// Look `key` up, waiting up to `timeout` for a background fetch
    pub fn get_blocking(&self, vbid: u16, key: &[u8], timeout: Duration) -> GetValue {
        let (tx, rx) = channel::bounded(1);
        let waiter: FetchCompletion = Box::new(move |status| {
            let _ = tx.send(status);
        });

        let first = self.get_with_waiter(vbid, key, Some(waiter));
        if first.status != EngineStatus::WouldBlock {
            return first;
        }
        match rx.recv_timeout(timeout) {
            Ok(EngineStatus::Success) => self.get(vbid, key),
            Ok(status) => GetValue { status, item: None },
            Err(_) => GetValue::temp_fail(),
        }
    }

    /// Eject `key`'s value from memory
    ///
    /// Returns the status and a human readable message.
    pub fn evict_key(&self, vbid: u16, key: &[u8]) -> (EngineStatus, &'static str) {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => return (status, "Not my vbucket."),
        };

        let mut hbl = vb.ht.get_locked_bucket(key);
        let state = vb
            .ht
            .unlocked_find(&mut hbl, key, WantsDeleted::No, TrackReference::No)
            .map(|v| (v.is_temp_item(), v.is_resident(), v.is_dirty()));
        match state {
            None | Some((true, _, _)) => (EngineStatus::KeyNotFound, "Not found."),
            Some((_, false, _)) => (EngineStatus::Success, "Already ejected."),
            Some((_, _, true)) => (EngineStatus::KeyExists, "Can't eject: Dirty object."),
            Some(_) => {
                if vb
                    .ht
                    .unlocked_eject_item(&mut hbl, key, self.config.eviction_policy)
                {
                    (EngineStatus::Success, "Ejected.")
                } else {
                    (EngineStatus::KeyExists, "Can't eject: Dirty object.")
                }
            }
        }
    }

    /// Fetch metadata for a mutation that needs to see what is on disk
    fn fetch_for_mutation(&self, vb: &Arc<VBucket>, key: &[u8]) -> EngineStatus {
        {
            let mut hbl = vb.ht.get_locked_bucket(key);
            if vb.ht.unlocked_add_temp_item(&mut hbl, key) == AddTempStatus::Exists {
                let in_flight = vb
                    .ht
                    .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                    .is_some_and(|v| v.is_temp_initial());
                if !in_flight {
                    return EngineStatus::KeyNotFound;
                }
            }
        }
        self.queue_bg_fetch(vb, key, None);
        EngineStatus::WouldBlock
    }

    fn queue_bg_fetch(&self, vb: &VBucket, key: &[u8], waiter: Option<FetchCompletion>) {
        let shard = self.shard_of(vb.id());
        let waiter = waiter.unwrap_or_else(|| Box::new(|_| {}));
        if shard.bg_fetcher.add_pending_fetch(vb.id(), key, waiter) {
            if let Some(id) = shard.bg_fetcher.task_id() {
                self.pool.wake(id);
            }
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush every shard's dirty queue; returns the writes committed
    ///
    /// Every shard is attempted; the first failure is returned.
    pub fn flush(&self, blocking: bool) -> Result<usize> {
        self.ensure_running()?;
        let mut written = 0;
        let mut first_error = None;
        for shard in &self.shards {
            match shard.flusher.flush(blocking) {
                Ok(n) => written += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Persist every vbucket's state now; returns how many were written
    pub fn snapshot_vbuckets(&self) -> usize {
        let shards = self.config.max_num_shards;
        self.shards
            .iter()
            .map(|shard| snapshot_shard(&*shard.store, &self.vbuckets, shard.id, shards))
            .sum()
    }

    fn schedule_snapshot(&self, vbid: u16, priority: Priority) {
        let shard = self.shard_of(vbid);
        let task = GlobalTask::with_shard(
            VBSnapshotTask::new(
                shard.store.clone(),
                self.vbuckets.clone(),
                shard.id,
                self.config.max_num_shards,
            ),
            priority,
            Duration::ZERO,
            false,
            shard.id,
        );
        self.pool.schedule(task);
    }

    // =========================================================================
    // VBucket management
    // =========================================================================

    /// Create `vbid` or change its role
    pub fn set_vbucket_state(&self, vbid: u16, state: VBucketStateKind) -> EngineStatus {
        if vbid as usize >= self.vbuckets.capacity() {
            return EngineStatus::NotMyVbucket;
        }

        match self.vbuckets.get(vbid) {
            Some(vb) => {
                let old = vb.set_state(state);
                if old != state && state == VBucketStateKind::Active {
                    vb.create_failover_entry(vb.high_seqno());
                }
                debug!(vbid, from = %old, to = %state, "Vbucket state changed");
            }
            None => {
                let vb = VBucket::new(
                    vbid,
                    state,
                    &self.config,
                    self.stats.clone(),
                    self.clock.clone(),
                    self.shard_of(vbid).queue.clone(),
                );
                self.vbuckets.insert(Arc::new(vb));
                info!(vbid, state = %state, "Created vbucket");
            }
        }

        self.schedule_snapshot(vbid, Priority::VBUCKET_PERSIST_HIGH);
        EngineStatus::Success
    }

    /// Drop `vbid` from memory and schedule removal of its file
    pub fn delete_vbucket(&self, vbid: u16) -> EngineStatus {
        if self.ensure_running().is_err() {
            return EngineStatus::TempFail;
        }
        let Some(vb) = self.vbuckets.remove(vbid) else {
            return EngineStatus::NotMyVbucket;
        };
        vb.ht.clear();

        let shard = self.shard_of(vbid);
        let task = GlobalTask::with_shard(
            VBDeleteTask::new(shard.store.clone(), vbid),
            Priority::VBUCKET_DELETION,
            Duration::ZERO,
            true,
            shard.id,
        );
        self.pool.schedule(task);
        info!(vbid, "Vbucket deleted");
        EngineStatus::Success
    }

    /// Schedule compaction of `vbid`
    pub fn compact(&self, vbid: u16, config: CompactionConfig) -> EngineStatus {
        if self.ensure_running().is_err() {
            return EngineStatus::TempFail;
        }
        if self.vbuckets.get(vbid).is_none() {
            return EngineStatus::NotMyVbucket;
        }
        let shard = self.shard_of(vbid);
        let task = GlobalTask::with_shard(
            CompactVBucketTask::new(
                shard.store.clone(),
                self.vbuckets.clone(),
                self.stats.clone(),
                self.clock.clone(),
                vbid,
                config,
            ),
            Priority::COMPACTOR,
            Duration::ZERO,
            false,
            shard.id,
        );
        self.pool.schedule(task);
        EngineStatus::Success
    }

    /// Compact `vbid` on the calling thread
    pub fn compact_now(&self, vbid: u16, config: CompactionConfig) -> Result<CompactionCtx> {
        self.ensure_running()?;
        let vb = self.vbuckets.get(vbid).ok_or(EpError::NotMyVbucket(vbid))?;
        let ctx = CompactionCtx {
            purge_before_ts: config.purge_before_ts,
            purge_before_seq: config.purge_before_seq,
            drop_deletes: config.drop_deletes,
            curr_time: self.clock.now(),
            ..Default::default()
        };
        compact_vbucket(&*self.shard_of(vbid).store, &vb, &self.stats, ctx)
            .ok_or_else(|| EpError::Storage(format!("compaction of vbucket {vbid} failed")))
    }

    /// Roll `vbid` back to `seqno`
    ///
    /// Outstanding writes are flushed first so the file reflects memory.
    /// If the store cannot roll back, the vbucket is reset to empty and the
    /// result reports failure.
    pub fn rollback(&self, vbid: u16, seqno: u64) -> Result<RollbackResult> {
        self.ensure_running()?;
        let vb = self.vbuckets.get(vbid).ok_or(EpError::NotMyVbucket(vbid))?;
        let shard = self.shard_of(vbid);
        if let Err(e) = shard.flusher.flush(false) {
            debug!(vbid, error = %e, "Flush before rollback failed");
        }

        let result = shard.store.rollback(vbid, seqno, &mut |rolled| {
            let mut hbl = vb.ht.get_locked_bucket(&rolled.key);
            vb.ht.unlocked_del(&mut hbl, &rolled.key);
            if let Some(item) = rolled.item.filter(|item| !item.deleted) {
                vb.ht.unlocked_restore_item(&mut hbl, &item);
            }
        });

        if result.success {
            vb.reset_seqnos(result.high_seqno);
            vb.create_failover_entry(result.high_seqno);
            info!(vbid, seqno, high_seqno = result.high_seqno, "Rolled back vbucket");
        } else {
            warn!(vbid, seqno, "Rollback impossible; resetting vbucket");
            vb.ht.clear();
            shard.store.del_vbucket(vbid);
            vb.reset_seqnos(0);
            vb.create_failover_entry(0);
        }
        Ok(result)
    }

    // =========================================================================
    // Warmup
    // =========================================================================

    /// Load every persisted vbucket into memory; returns items loaded
    ///
    /// Keys already resident are skipped. Once memory passes the high water
    /// mark only keys and metadata are loaded (value-only) or loading stops
    /// (full eviction).
    pub fn warmup(&self) -> Result<usize> {
        let mut loaded = 0;
        for shard in &self.shards {
            for (vbid, state) in shard.store.list_persisted_vbuckets().into_iter().enumerate() {
                let Some(state) = state else {
                    continue;
                };
                let vbid = vbid as u16;
                if vbid as usize >= self.vbuckets.capacity() {
                    warn!(vbid, "Persisted vbucket beyond max_vbuckets; ignored");
                    continue;
                }
                let vb = match self.vbuckets.get(vbid) {
                    Some(vb) => vb,
                    None => {
                        let vb = Arc::new(VBucket::from_persisted(
                            vbid,
                            &state,
                            &self.config,
                            self.stats.clone(),
                            self.clock.clone(),
                            shard.queue.clone(),
                        ));
                        self.vbuckets.insert(vb.clone());
                        vb
                    }
                };
                loaded += self.warmup_vbucket(shard, &vb, &state)?;
            }
        }
        info!(loaded, mem_used = self.stats.mem_used(), "Warmup complete");
        Ok(loaded)
    }

    fn warmup_vbucket(&self, shard: &Shard, vb: &Arc<VBucket>, state: &VBucketState) -> Result<usize> {
        let loaded = Arc::new(AtomicUsize::new(0));

        let value_cb = {
            let vb = vb.clone();
            let loaded = loaded.clone();
            let stats = self.stats.clone();
            let high_wat = self.config.mem_high_wat;
            let policy = self.config.eviction_policy;
            Box::new(move |fetched: GetValue| {
                let Some(item) = fetched.item else {
                    return ScanControl::Continue;
                };
                if item.deleted {
                    return ScanControl::Continue;
                }
                if item.value.is_some() && stats.mem_used() >= high_wat {
                    return match policy {
                        EvictionPolicy::ValueOnly => ScanControl::Pause,
                        EvictionPolicy::FullEviction => ScanControl::Continue,
                    };
                }
                if vb.ht.restore_item(&item) {
                    loaded.fetch_add(1, Ordering::Relaxed);
                }
                ScanControl::Continue
            })
        };
        let lookup_cb = {
            let vb = vb.clone();
            Box::new(move |key: &CacheLookupKey| {
                match vb.ht.find(&key.key, TrackReference::No, WantsDeleted::Yes) {
                    Some(v) if !v.is_temp_item() => CacheLookup::Skip,
                    _ => CacheLookup::Fetch,
                }
            })
        };

        let Some(mut ctx) = shard.store.init_scan_context(
            value_cb,
            lookup_cb,
            vb.id(),
            0,
            DocumentFilter::AllItems,
            ValueFilter::Values,
        ) else {
            return Ok(0);
        };

        let high_seqno = ctx.max_seqno.max(state.high_seqno);
        let status = loop {
            match shard.store.scan(&mut ctx) {
                ScanStatus::Again => ctx.value_filter = ValueFilter::KeysOnly,
                status => break status,
            }
        };
        shard.store.destroy_scan_context(ctx);

        if status == ScanStatus::Failed {
            return Err(EpError::Storage(format!(
                "warmup scan of vbucket {} failed",
                vb.id()
            )));
        }
        if high_seqno > vb.high_seqno() {
            vb.set_high_seqno(high_seqno);
        }
        vb.note_persisted(high_seqno);

        let loaded = loaded.load(Ordering::Relaxed);
        debug!(vbid = vb.id(), loaded, high_seqno, "Warmed up vbucket");
        Ok(loaded)
    }

    // =========================================================================
    // Stats & shutdown
    // =========================================================================

    /// Emit engine, hash table and store statistics
    pub fn stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        self.stats.add_stats(add_stat);

        let vbuckets = self.vbuckets.all();
        let mut curr_items = 0;
        let mut non_resident = 0;
        let mut temp_items = 0;
        let mut kv_size = 0;
        let mut by_state = [0usize; 4];
        for vb in &vbuckets {
            curr_items += vb.ht.num_items().saturating_sub(vb.ht.num_deleted_items());
            non_resident += vb.ht.num_non_resident_items();
            temp_items += vb.ht.num_temp_items();
            kv_size += vb.ht.cache_size();
            by_state[vb.state() as usize] += 1;
        }

        let mut emit = |name: &str, value: String| add_stat(name, &value);
        emit("curr_items", curr_items.to_string());
        emit("ep_num_non_resident", non_resident.to_string());
        emit("ep_num_temp_items", temp_items.to_string());
        emit("ep_kv_size", kv_size.to_string());
        emit("ep_max_size", self.config.max_size.to_string());
        emit("ep_mem_high_wat", self.config.mem_high_wat.to_string());
        emit("ep_mem_low_wat", self.config.mem_low_wat.to_string());
        emit("vb_active_num", by_state[VBucketStateKind::Active as usize].to_string());
        emit("vb_replica_num", by_state[VBucketStateKind::Replica as usize].to_string());
        emit("vb_pending_num", by_state[VBucketStateKind::Pending as usize].to_string());
        emit("vb_dead_num", by_state[VBucketStateKind::Dead as usize].to_string());
        emit("ep_flusher_state", self.flusher_state().as_str().to_string());
        emit("ep_num_tasks", self.pool.num_tasks().to_string());

        for shard in &self.shards {
            shard.store.add_stats(add_stat);
        }
    }

    /// Shared state of the flushers (the first one not running, if any)
    fn flusher_state(&self) -> FlusherState {
        self.shards
            .iter()
            .map(|s| s.flusher.state())
            .find(|s| *s != FlusherState::Running)
            .unwrap_or(FlusherState::Running)
    }

    /// Stop background work, drain the dirty queues and snapshot states
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down store");

        if let Some(id) = self.pager_task.lock().take() {
            self.pool.cancel(id);
        }
        let mut first_error = None;
        for shard in &self.shards {
            if let Err(e) = shard.flusher.stop(&self.pool) {
                first_error.get_or_insert(e);
            }
        }
        self.snapshot_vbuckets();
        self.pool.shutdown();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for EpStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Dirty items left unpersisted at shutdown");
        }
    }
}

impl std::fmt::Debug for EpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpStore")
            .field("data_dir", &self.config.data_dir)
            .field("shards", &self.shards.len())
            .field("vbuckets", &self.vbuckets.all().len())
            .field("mem_used", &self.stats.mem_used())
            .finish()
    }
}
