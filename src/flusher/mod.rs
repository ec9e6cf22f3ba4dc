//! Flusher Module
//!
//! Moves dirty items from memory to the backing store.
//!
//! ## Responsibilities
//! - Swap the shard's [`DirtyQueue`] out in O(1)
//! - Re-read each key under its bucket lock and copy out what must be written
//! - Write bounded transactions (`txn_size` items per `begin`/`commit`)
//! - Mark items clean from the persistence callbacks, or re-queue them
//!
//! ## Flush Flow
//! ```text
//!   DirtyQueue ──swap──► batch ──chunks of txn_size──► begin()
//!                                      │
//!            for each key: lock bucket, copy Item, unlock
//!              dirty value ──► set     dirty tombstone ──► del
//!              absent      ──► del     clean           ──► skip
//!                                      │
//!                                   commit() ──► callbacks(ok)
//!                                      │
//!            ok:  mark clean if CAS unchanged, drop persisted tombstones
//!            err: re-queue key (item stays dirty)
//! ```
//!
//! ## Lifecycle
//! `Stopped ──start()──► Running ──stop()──► ShuttingDown ──drained──► Stopped`

mod dirty_queue;
mod task;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{EpError, Result};
use crate::executor::{ExecutorPool, GlobalTask, Priority, TaskId};
use crate::hashtable::{TrackReference, WantsDeleted};
use crate::item::Item;
use crate::kvstore::KvStore;
use crate::stats::EngineStats;
use crate::time::{Clock, RelTime};
use crate::vbucket::{VBucket, VBucketMap};

pub use dirty_queue::{DirtyQueue, QueuedItem};
pub use task::FlusherTask;

/// Flusher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    Stopped,
    Running,
    ShuttingDown,
}

impl FlusherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlusherState::Stopped => "stopped",
            FlusherState::Running => "running",
            FlusherState::ShuttingDown => "shutting_down",
        }
    }
}

/// A write copied out from under a bucket lock
enum PendingWrite {
    Set(Item),
    Del(Item),
}

/// Persists one shard's dirty items
pub struct Flusher {
    shard_id: u16,
    store: Arc<dyn KvStore>,
    vbuckets: Arc<VBucketMap>,
    queue: Arc<DirtyQueue>,
    stats: Arc<EngineStats>,
    clock: Arc<dyn Clock>,

    txn_size: usize,
    idle_wait: Duration,
    max_dirty_age: RelTime,

    state: Mutex<FlusherState>,
    task_id: Mutex<Option<TaskId>>,

    /// Serializes flushes from the task and from explicit callers
    flush_lock: Mutex<()>,
}

impl Flusher {
    pub fn new(
        shard_id: u16,
        store: Arc<dyn KvStore>,
        vbuckets: Arc<VBucketMap>,
        queue: Arc<DirtyQueue>,
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            shard_id,
            store,
            vbuckets,
            queue,
            stats,
            clock,
            txn_size: config.txn_size.max(1),
            idle_wait: config.flusher_idle_wait,
            max_dirty_age: config.max_dirty_age.as_secs().min(RelTime::MAX as u64) as RelTime,
            state: Mutex::new(FlusherState::Stopped),
            task_id: Mutex::new(None),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock()
    }

    pub fn queue(&self) -> &Arc<DirtyQueue> {
        &self.queue
    }

    pub(crate) fn idle_wait(&self) -> Duration {
        self.idle_wait
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Schedule the flusher task; false if already running
    pub fn start(self: &Arc<Self>, pool: &ExecutorPool) -> bool {
        let mut state = self.state.lock();
        if *state != FlusherState::Stopped {
            return false;
        }
        *state = FlusherState::Running;

        let task = GlobalTask::new(
            FlusherTask::new(self.clone()),
            Priority::FLUSHER,
            Duration::ZERO,
            true,
        );
        let id = pool.schedule(task);
        *self.task_id.lock() = Some(id);
        self.queue.set_waker(Some(pool.waker(id)));
        info!(shard = self.shard_id, "Flusher started");
        true
    }

    /// Stop the task and drain the queue once more
    ///
    /// Returns the number of items written while draining. Calling it on a
    /// flusher that is not running does nothing.
    pub fn stop(&self, pool: &ExecutorPool) -> Result<usize> {
        {
            let mut state = self.state.lock();
            if *state != FlusherState::Running {
                return Ok(0);
            }
            *state = FlusherState::ShuttingDown;
        }
        self.queue.set_waker(None);
        if let Some(id) = self.task_id.lock().take() {
            pool.cancel(id);
        }

        // A flush that finds nothing has waited out any in-flight task run
        let mut drained = 0;
        let result = loop {
            match self.flush(false) {
                Ok(0) if self.queue.is_empty() => break Ok(drained),
                Ok(n) => drained += n,
                Err(e) => break Err(e),
            }
        };

        *self.state.lock() = FlusherState::Stopped;
        info!(shard = self.shard_id, drained, "Flusher stopped");
        result
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Persist everything currently queued
    ///
    /// With `blocking`, an empty queue is waited on for up to the idle wait.
    /// Returns the number of writes committed.
    pub fn flush(&self, blocking: bool) -> Result<usize> {
        let _serial = self.flush_lock.lock();

        if blocking && self.queue.is_empty() {
            self.queue.wait_for_work(self.idle_wait);
        }
        let batch = self.queue.swap();
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut remaining = batch.len();
        let mut written = 0;
        let mut commit_time = Duration::ZERO;
        self.stats.flusher_todo.add(remaining as u64);
        trace!(shard = self.shard_id, items = remaining, "Flushing batch");

        let mut chunks = batch.chunks(self.txn_size);
        while let Some(chunk) = chunks.next() {
            let writes: Vec<_> = chunk
                .iter()
                .filter_map(|queued| self.prepare(queued).map(|w| (queued, w)))
                .collect();
            remaining -= chunk.len();
            self.stats.flusher_todo.sub(chunk.len() as u64);
            if writes.is_empty() {
                continue;
            }

            if !self.store.begin() {
                self.stats.flusher_todo.sub(remaining as u64);
                let pending = self
                    .queue
                    .requeue(chunk.iter().chain(chunks.by_ref().flatten()).cloned());
                return Err(EpError::Storage(format!(
                    "transaction already open on shard {}; {pending} items re-queued",
                    self.shard_id
                )));
            }

            let failed = Arc::new(AtomicUsize::new(0));
            let count = writes.len();
            for (queued, write) in writes {
                self.submit(queued, write, &failed);
            }

            let commit_started = Instant::now();
            let committed = self.store.commit();
            commit_time += commit_started.elapsed();

            let failed = failed.load(Ordering::Acquire);
            written += count - failed;
            if !committed {
                self.stats.flusher_todo.sub(remaining as u64);
                let requeued = self.queue.requeue(chunks.by_ref().flatten().cloned());
                self.record_duration(started, commit_time);
                return Err(EpError::CommitFailed {
                    pending: failed + requeued,
                });
            }
        }

        self.record_duration(started, commit_time);
        debug!(shard = self.shard_id, written, "Flush complete");
        Ok(written)
    }

    /// Copy out what `queued` needs written, if anything
    fn prepare(&self, queued: &QueuedItem) -> Option<PendingWrite> {
        let Some(vb) = self.vbuckets.get(queued.vbid) else {
            trace!(vbid = queued.vbid, "Dropping queued key for missing vbucket");
            return None;
        };

        let mut hbl = vb.ht.get_locked_bucket(&queued.key);
        match vb
            .ht
            .unlocked_find(&mut hbl, &queued.key, WantsDeleted::Yes, TrackReference::No)
        {
            Some(v) if v.is_temp_item() => None,
            Some(v) if !v.is_dirty() => {
                self.stats.flusher_skipped.increment();
                None
            }
            Some(v) if v.is_deleted() => Some(PendingWrite::Del(v.to_item(queued.vbid))),
            Some(v) => Some(PendingWrite::Set(v.to_item(queued.vbid))),
            None => Some(PendingWrite::Del(Item::deletion(
                queued.key.clone(),
                queued.vbid,
            ))),
        }
    }

    fn submit(&self, queued: &QueuedItem, write: PendingWrite, failed: &Arc<AtomicUsize>) {
        let vb = self.vbuckets.get(queued.vbid);
        let (item, is_set) = match write {
            PendingWrite::Set(item) => (item, true),
            PendingWrite::Del(item) => (item, false),
        };
        let callback = PersistCallback {
            vb,
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            clock: self.clock.clone(),
            max_dirty_age: self.max_dirty_age,
            queued: queued.clone(),
            cas: item.cas,
            seqno: item.by_seqno,
            failed: failed.clone(),
        };

        if is_set {
            self.store.set(&item, Box::new(move |ok| callback.complete(ok)));
        } else {
            self.store.del(&item, Box::new(move |ok| callback.complete(ok)));
        }
    }

    fn record_duration(&self, started: Instant, commit_time: Duration) {
        let flush_ms = started.elapsed().as_millis() as u64;
        self.stats.flush_duration.set(flush_ms);
        self.stats.flush_duration_high_wat.set_max(flush_ms);
        self.stats.commit_time.set(commit_time.as_millis() as u64);
    }
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("shard_id", &self.shard_id)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Completion of one persisted write
struct PersistCallback {
    vb: Option<Arc<VBucket>>,
    queue: Arc<DirtyQueue>,
    stats: Arc<EngineStats>,
    clock: Arc<dyn Clock>,
    max_dirty_age: RelTime,
    queued: QueuedItem,
    cas: u64,
    seqno: u64,
    failed: Arc<AtomicUsize>,
}

impl PersistCallback {
    fn complete(self, ok: bool) {
        if !ok {
            self.stats.flusher_commit_failed.increment();
            self.failed.fetch_add(1, Ordering::AcqRel);
            self.queue.requeue([self.queued]);
            return;
        }

        self.stats.total_persisted.increment();
        let Some(vb) = self.vb.as_ref() else {
            return;
        };
        vb.note_persisted(self.seqno);

        let key = &self.queued.key;
        let mut redirtied = false;
        {
            let mut hbl = vb.ht.get_locked_bucket(key);
            let mut remove_tombstone = false;
            if let Some(v) = vb
                .ht
                .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
            {
                if v.is_dirty() && !v.is_temp_item() {
                    if v.cas() == self.cas {
                        let (queued_at, dirtied_at) = v.mark_clean();
                        self.record_aging(queued_at, dirtied_at);
                        remove_tombstone = v.is_deleted();
                    } else {
                        redirtied = true;
                    }
                }
            }
            if remove_tombstone {
                vb.ht.unlocked_del(&mut hbl, key);
            }
        }

        // A newer mutation landed while this write was in flight
        if redirtied {
            self.queue.push(self.queued.vbid, key, self.clock.now());
        }
    }

    fn record_aging(&self, queued_at: RelTime, dirtied_at: RelTime) {
        let now = self.clock.now();
        let mut dirty_age = now.saturating_sub(queued_at);
        let data_age = now.saturating_sub(dirtied_at).min(self.max_dirty_age);

        if dirty_age > self.max_dirty_age {
            warn!(
                dirty_age,
                max_dirty_age = self.max_dirty_age,
                "Dirty age exceeds the maximum; clamping"
            );
            debug_assert!(dirty_age <= self.max_dirty_age, "dirty age {dirty_age} out of range");
            dirty_age = self.max_dirty_age;
        }

        self.stats.dirty_age.set(dirty_age as u64);
        self.stats.dirty_age_high_wat.set_max(dirty_age as u64);
        self.stats.data_age.set(data_age as u64);
        self.stats.data_age_high_wat.set_max(data_age as u64);
    }
}
