//! Background Fetcher
//!
//! Reads evicted values back from disk on behalf of blocked readers.
//!
//! ## Responsibilities
//! - Collect fetch requests per vbucket, one entry per key with every waiter
//! - Batch each vbucket's keys into a single `get_multi`
//! - Install results in the hash table and notify waiters with the outcome
//!
//! ```text
//!   get() miss ──► add_pending_fetch(vb, key, waiter) ──► WouldBlock
//!                          │
//!                 BgFetcherTask (woken)
//!                          │
//!        get_multi(vb, keys) ──► restore value / item / temp state
//!                          │
//!                  waiter(status) for every waiter of the key
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::executor::{GlobalTask, Task, TaskId};
use crate::hashtable::{EvictionPolicy, TempState, TrackReference, WantsDeleted};
use crate::item::EngineStatus;
use crate::kvstore::{GetValue, KvStore};
use crate::stats::EngineStats;
use crate::vbucket::{VBucket, VBucketMap};

/// Notified once a background fetch for the caller's key completes
pub type FetchCompletion = Box<dyn FnOnce(EngineStatus) + Send>;

#[derive(Default)]
struct PendingFetches {
    by_vbucket: HashMap<u16, HashMap<Vec<u8>, Vec<FetchCompletion>>>,
    /// When the oldest outstanding request arrived
    since: Option<Instant>,
}

/// Per-shard fetch-from-disk service
pub struct BgFetcher {
    shard_id: u16,
    store: Arc<dyn KvStore>,
    vbuckets: Arc<VBucketMap>,
    stats: Arc<EngineStats>,
    eviction_policy: EvictionPolicy,
    delay: Duration,
    pending: Mutex<PendingFetches>,
    task_id: Mutex<Option<TaskId>>,
}

impl BgFetcher {
    pub fn new(
        shard_id: u16,
        store: Arc<dyn KvStore>,
        vbuckets: Arc<VBucketMap>,
        stats: Arc<EngineStats>,
        eviction_policy: EvictionPolicy,
        delay: Duration,
    ) -> Self {
        Self {
            shard_id,
            store,
            vbuckets,
            stats,
            eviction_policy,
            delay,
            pending: Mutex::new(PendingFetches::default()),
            task_id: Mutex::new(None),
        }
    }

    pub fn shard_id(&self) -> u16 {
        self.shard_id
    }

    pub(crate) fn set_task_id(&self, id: TaskId) {
        *self.task_id.lock() = Some(id);
    }

    pub fn task_id(&self) -> Option<TaskId> {
        *self.task_id.lock()
    }

    /// Register `waiter` for `key`
    ///
    /// Returns true if the fetcher was idle and needs scheduling.
    pub fn add_pending_fetch(&self, vbid: u16, key: &[u8], waiter: FetchCompletion) -> bool {
        let mut pending = self.pending.lock();
        let was_idle = pending.by_vbucket.is_empty();
        if was_idle {
            pending.since = Some(Instant::now());
        }
        pending
            .by_vbucket
            .entry(vbid)
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .push(waiter);
        was_idle
    }

    /// Keys waiting for a fetch
    pub fn num_pending(&self) -> usize {
        self.pending.lock().by_vbucket.values().map(HashMap::len).sum()
    }

    /// Time left before the current batch should be fetched
    pub fn batch_wait(&self) -> Duration {
        match self.pending.lock().since {
            Some(since) => self.delay.saturating_sub(since.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Serve every pending request; returns the number of keys fetched
    pub fn run_once(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut fetched = 0;

        for (vbid, requests) in pending.by_vbucket {
            let Some(vb) = self.vbuckets.get(vbid) else {
                debug!(vbid, "Vbucket gone before background fetch");
                for waiter in requests.into_values().flatten() {
                    waiter(EngineStatus::NotMyVbucket);
                }
                continue;
            };

            let (keys, waiters): (Vec<_>, Vec<_>) = requests.into_iter().unzip();
            let results = self.store.get_multi(vbid, &keys);
            trace!(vbid, keys = keys.len(), "Background fetch batch");

            for ((key, waiters), result) in keys.iter().zip(waiters).zip(results) {
                let status = self.complete(&vb, key, result);
                fetched += 1;
                for waiter in waiters {
                    waiter(status);
                }
            }
        }
        fetched
    }

    /// Install one fetched key, returning the status waiters see
    fn complete(&self, vb: &VBucket, key: &[u8], result: GetValue) -> EngineStatus {
        let mut hbl = vb.ht.get_locked_bucket(key);

        match (self.eviction_policy, result.status, result.item) {
            (_, EngineStatus::TempFail, _) => {
                self.stats.bg_fetch_failed.increment();
                debug!(vbid = vb.id(), "Background fetch failed; reader must retry");
                if self.eviction_policy == EvictionPolicy::FullEviction {
                    let placeholder = vb
                        .ht
                        .unlocked_find(&mut hbl, key, WantsDeleted::Yes, TrackReference::No)
                        .is_some_and(|v| v.is_temp_initial());
                    if placeholder {
                        vb.ht.unlocked_del(&mut hbl, key);
                    }
                }
                EngineStatus::TempFail
            }
            (EvictionPolicy::ValueOnly, EngineStatus::Success, Some(item)) => {
                self.stats.bg_fetched.increment();
                vb.ht.unlocked_restore_value(&mut hbl, &item);
                EngineStatus::Success
            }
            (EvictionPolicy::FullEviction, EngineStatus::Success, Some(item)) => {
                self.stats.bg_fetched.increment();
                vb.ht.unlocked_restore_item(&mut hbl, &item);
                EngineStatus::Success
            }
            (EvictionPolicy::FullEviction, _, tombstone) => {
                let state = match tombstone {
                    Some(_) => TempState::Deleted,
                    None => TempState::NonExistent,
                };
                vb.ht.unlocked_set_temp_state(&mut hbl, key, state);
                EngineStatus::KeyNotFound
            }
            (EvictionPolicy::ValueOnly, _, _) => EngineStatus::KeyNotFound,
        }
    }
}

impl std::fmt::Debug for BgFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgFetcher")
            .field("shard_id", &self.shard_id)
            .field("pending", &self.num_pending())
            .finish()
    }
}

/// Idle task woken whenever a fetch is queued
pub struct BgFetcherTask {
    fetcher: Arc<BgFetcher>,
}

/// How long an idle fetcher sleeps before checking again
pub(crate) const IDLE_SLEEP: Duration = Duration::from_secs(60);

impl BgFetcherTask {
    pub fn new(fetcher: Arc<BgFetcher>) -> Self {
        Self { fetcher }
    }
}

impl Task for BgFetcherTask {
    fn run(&self, handle: &GlobalTask) -> bool {
        let wait = self.fetcher.batch_wait();
        if !wait.is_zero() {
            handle.snooze(wait);
            return true;
        }
        self.fetcher.run_once();
        if self.fetcher.num_pending() > 0 {
            handle.snooze(Duration::ZERO);
        } else {
            handle.snooze(IDLE_SLEEP);
        }
        true
    }

    fn description(&self) -> String {
        format!("Batching background fetch: shard {}", self.fetcher.shard_id())
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(1)
    }
}
