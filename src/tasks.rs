//! Background maintenance tasks
//!
//! - [`VBSnapshotTask`]: persist vbucket states for one shard
//! - [`CompactVBucketTask`]: rewrite a vbucket file, purging old tombstones
//! - [`VBDeleteTask`]: remove a vbucket's file
//! - [`ItemPager`]: eject clean values while memory is above the high mark
//!
//! Tasks that touch a shard's files are tagged with that shard so the
//! executor never runs two of them at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::executor::{GlobalTask, Task};
use crate::hashtable::{
    EvictionPolicy, HashTableVisitor, Position, StoredValue, MAX_NRU_VALUE,
};
use crate::kvstore::{CompactionCtx, KvStore, VBStatePersist};
use crate::stats::EngineStats;
use crate::time::Clock;
use crate::vbucket::{VBucket, VBucketMap};

// =============================================================================
// Snapshot
// =============================================================================

/// Persist the state of every vbucket in `shard`; returns how many succeeded
pub fn snapshot_shard(
    store: &dyn KvStore,
    vbuckets: &VBucketMap,
    shard: u16,
    shards: u16,
) -> usize {
    let mut persisted = 0;
    for vb in vbuckets.for_shard(shard, shards) {
        if store.snapshot_vbucket(vb.id(), &vb.persisted_state(), VBStatePersist::PersistWithCommit)
        {
            persisted += 1;
        }
    }
    persisted
}

/// One-shot snapshot of a shard's vbucket states
pub struct VBSnapshotTask {
    store: Arc<dyn KvStore>,
    vbuckets: Arc<VBucketMap>,
    shard: u16,
    shards: u16,
}

impl VBSnapshotTask {
    pub fn new(store: Arc<dyn KvStore>, vbuckets: Arc<VBucketMap>, shard: u16, shards: u16) -> Self {
        Self {
            store,
            vbuckets,
            shard,
            shards,
        }
    }
}

impl Task for VBSnapshotTask {
    fn run(&self, _handle: &GlobalTask) -> bool {
        let persisted = snapshot_shard(&*self.store, &self.vbuckets, self.shard, self.shards);
        debug!(shard = self.shard, persisted, "Snapshotted vbucket states");
        false
    }

    fn description(&self) -> String {
        format!("Snapshotting vbucket states for shard {}", self.shard)
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(1)
    }
}

// =============================================================================
// Compaction
// =============================================================================

/// Compact `vb`'s file and delete the items it found expired
///
/// Returns the finished context, or `None` if compaction failed.
pub fn compact_vbucket(
    store: &dyn KvStore,
    vb: &VBucket,
    stats: &EngineStats,
    mut ctx: CompactionCtx,
) -> Option<CompactionCtx> {
    if !store.compact_db(vb.id(), &mut ctx) {
        return None;
    }
    vb.note_purged(ctx.max_purged_seq);

    let mut expired = 0;
    for item in &ctx.expired_items {
        if vb.delete_expired(item) {
            expired += 1;
        }
    }
    stats.expired_compactor.add(expired);
    info!(
        vbid = vb.id(),
        max_purged_seq = ctx.max_purged_seq,
        expired,
        "Compaction complete"
    );
    Some(ctx)
}

/// Parameters of a scheduled compaction
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionConfig {
    pub purge_before_ts: u32,
    pub purge_before_seq: u64,
    pub drop_deletes: bool,
}

/// One-shot compaction of a vbucket
pub struct CompactVBucketTask {
    store: Arc<dyn KvStore>,
    vbuckets: Arc<VBucketMap>,
    stats: Arc<EngineStats>,
    clock: Arc<dyn Clock>,
    vbid: u16,
    config: CompactionConfig,
}

impl CompactVBucketTask {
    pub fn new(
        store: Arc<dyn KvStore>,
        vbuckets: Arc<VBucketMap>,
        stats: Arc<EngineStats>,
        clock: Arc<dyn Clock>,
        vbid: u16,
        config: CompactionConfig,
    ) -> Self {
        Self {
            store,
            vbuckets,
            stats,
            clock,
            vbid,
            config,
        }
    }
}

impl Task for CompactVBucketTask {
    fn run(&self, _handle: &GlobalTask) -> bool {
        let Some(vb) = self.vbuckets.get(self.vbid) else {
            debug!(vbid = self.vbid, "Skipping compaction of missing vbucket");
            return false;
        };
        let ctx = CompactionCtx {
            purge_before_ts: self.config.purge_before_ts,
            purge_before_seq: self.config.purge_before_seq,
            drop_deletes: self.config.drop_deletes,
            curr_time: self.clock.now(),
            ..Default::default()
        };
        if compact_vbucket(&*self.store, &vb, &self.stats, ctx).is_none() {
            debug!(vbid = self.vbid, "Compaction task failed");
        }
        false
    }

    fn description(&self) -> String {
        format!("Compact vbucket {}", self.vbid)
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(60)
    }
}

// =============================================================================
// VBucket deletion
// =============================================================================

/// One-shot removal of a vbucket's file
pub struct VBDeleteTask {
    store: Arc<dyn KvStore>,
    vbid: u16,
}

impl VBDeleteTask {
    pub fn new(store: Arc<dyn KvStore>, vbid: u16) -> Self {
        Self { store, vbid }
    }
}

impl Task for VBDeleteTask {
    fn run(&self, _handle: &GlobalTask) -> bool {
        if self.store.del_vbucket(self.vbid) {
            info!(vbid = self.vbid, "Deleted vbucket file");
        }
        false
    }

    fn description(&self) -> String {
        format!("Deleting VBucket:{}", self.vbid)
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(10)
    }
}

// =============================================================================
// Item pager
// =============================================================================

/// Keys collected before the pager pauses to eject them
const EJECT_BATCH: usize = 64;

/// Collects clean resident keys whose NRU has aged to the maximum
struct PagerVisitor {
    candidates: Vec<Vec<u8>>,
}

impl HashTableVisitor for PagerVisitor {
    fn visit(&mut self, _bucket_num: usize, v: &mut StoredValue) -> bool {
        if v.is_temp_item() || v.is_dirty() || v.is_deleted() || !v.is_resident() {
            return true;
        }
        if v.nru_value() == MAX_NRU_VALUE {
            self.candidates.push(v.key().to_vec());
        } else {
            v.age_nru();
        }
        self.candidates.len() < EJECT_BATCH
    }
}

/// Periodic task keeping memory between the low and high water marks
pub struct ItemPager {
    vbuckets: Arc<VBucketMap>,
    stats: Arc<EngineStats>,
    policy: EvictionPolicy,
    high_wat: usize,
    low_wat: usize,
    sleep: Duration,
}

impl ItemPager {
    pub fn new(
        vbuckets: Arc<VBucketMap>,
        stats: Arc<EngineStats>,
        policy: EvictionPolicy,
        low_wat: usize,
        high_wat: usize,
        sleep: Duration,
    ) -> Self {
        Self {
            vbuckets,
            stats,
            policy,
            high_wat,
            low_wat,
            sleep,
        }
    }

    /// Eject until memory drops below the low mark; returns items ejected
    ///
    /// Does nothing unless memory is above the high mark. Each pass ages
    /// every clean value once, so at most `MAX_NRU_VALUE + 1` passes run.
    pub fn page(&self) -> usize {
        let start_mem = self.stats.mem_used();
        if start_mem <= self.high_wat {
            return 0;
        }

        let mut ejected = 0;
        'passes: for _ in 0..=MAX_NRU_VALUE {
            for vb in self.vbuckets.all() {
                let mut pos = Position::default();
                loop {
                    if self.stats.mem_used() <= self.low_wat {
                        break 'passes;
                    }
                    let mut visitor = PagerVisitor {
                        candidates: Vec::new(),
                    };
                    pos = vb.ht.pause_resume_visit(&mut visitor, pos);
                    ejected += self.eject(&vb, visitor.candidates);
                    if pos.lock >= vb.ht.num_locks() {
                        break;
                    }
                }
            }
        }

        if ejected > 0 {
            self.stats.pager_runs.increment();
            info!(
                ejected,
                mem_before = start_mem,
                mem_after = self.stats.mem_used(),
                "Item pager ejected items"
            );
        } else {
            debug!(mem_used = start_mem, "Item pager found nothing to eject");
        }
        ejected
    }

    fn eject(&self, vb: &VBucket, keys: Vec<Vec<u8>>) -> usize {
        keys.into_iter()
            .filter(|key| {
                let mut hbl = vb.ht.get_locked_bucket(key);
                vb.ht.unlocked_eject_item(&mut hbl, key, self.policy)
            })
            .count()
    }
}

impl Task for ItemPager {
    fn run(&self, handle: &GlobalTask) -> bool {
        self.page();
        handle.snooze(self.sleep);
        true
    }

    fn description(&self) -> String {
        "Paging out items.".to_string()
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(25)
    }
}
