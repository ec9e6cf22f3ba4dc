//! Engine Tests
//!
//! Tests verify:
//! - Set/get/delete through to the backing store
//! - Vbucket state and memory quota checks
//! - Warmup after reopen
//! - Ejection and background fetches under both eviction policies
//! - Vbucket lifecycle: state changes, deletion, compaction, rollback
//! - Stats and shutdown

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use epkv::hashtable::{TrackReference, WantsDeleted};
use epkv::kvstore::{FileKvStoreConfig, KvStore};
use epkv::time::{Clock, ManualClock};
use epkv::{
    CompactionConfig, Config, EngineStatus, EpError, EpStore, EvictionPolicy, FileKvStore, Item,
    VBucketStateKind,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(dir: &std::path::Path) -> epkv::config::ConfigBuilder {
    Config::builder()
        .data_dir(dir)
        .max_vbuckets(8)
        .max_num_shards(2)
        .num_workers(2)
        .bg_fetch_delay(Duration::ZERO)
}

fn setup_temp_store() -> (TempDir, EpStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
    assert_eq!(store.set_vbucket_state(0, VBucketStateKind::Active), EngineStatus::Success);
    (temp_dir, store)
}

fn setup_full_eviction() -> (TempDir, EpStore) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path())
        .eviction_policy(EvictionPolicy::FullEviction)
        .build();
    let store = EpStore::open(config).unwrap();
    store.set_vbucket_state(0, VBucketStateKind::Active);
    (temp_dir, store)
}

/// Open with a clock the test controls
fn setup_with_clock() -> (TempDir, EpStore, Arc<ManualClock>) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).build();
    let stores: Vec<Arc<dyn KvStore>> = (0..config.max_num_shards)
        .map(|shard| {
            let store = FileKvStore::open(FileKvStoreConfig::from_config(&config, shard)).unwrap();
            Arc::new(store) as Arc<dyn KvStore>
        })
        .collect();
    let clock = Arc::new(ManualClock::new(1));
    let store = EpStore::open_with(config, clock.clone() as Arc<dyn Clock>, stores).unwrap();
    store.set_vbucket_state(0, VBucketStateKind::Active);
    (temp_dir, store, clock)
}

/// Stop vbucket 0's flusher so dirty items stay dirty until flushed by hand
fn pause_flusher(store: &EpStore) {
    store.flusher(0).stop(store.pool()).unwrap();
}

fn item(key: &str, value: &str) -> Item {
    Item::new(key.as_bytes().to_vec(), value.as_bytes().to_vec())
}

fn value_of(store: &EpStore, vbid: u16, key: &str) -> Option<Vec<u8>> {
    let got = store.get(vbid, key.as_bytes());
    match got.status {
        EngineStatus::Success => got.item.and_then(|i| i.value).map(|v| v.to_vec()),
        _ => None,
    }
}

fn collect_stats(store: &EpStore) -> HashMap<String, String> {
    let mut stats = HashMap::new();
    store.stats(&mut |k, v| {
        stats.insert(k.to_string(), v.to_string());
    });
    stats
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_set_flush_delete_reaches_disk() {
    let (_dir, store) = setup_temp_store();
    pause_flusher(&store);
    let vb = store.vbucket(0).unwrap();

    assert_eq!(store.set(&item("k1", "v1")), EngineStatus::Success);
    let stored = vb.ht.find(b"k1", TrackReference::No, WantsDeleted::No).unwrap();
    assert!(stored.is_dirty());

    assert_eq!(store.flush(false).unwrap(), 1);
    let stored = vb.ht.find(b"k1", TrackReference::No, WantsDeleted::No).unwrap();
    assert!(!stored.is_dirty());
    let on_disk = store.kvstore(0).get(b"k1", 0);
    assert_eq!(on_disk.status, EngineStatus::Success);
    assert_eq!(on_disk.item.unwrap().value.unwrap().to_vec(), b"v1".to_vec());

    assert_eq!(store.del(0, b"k1", 0), EngineStatus::Success);
    assert_eq!(store.flush(false).unwrap(), 1);
    assert_eq!(store.kvstore(0).get(b"k1", 0).status, EngineStatus::KeyNotFound);
    assert_eq!(store.get(0, b"k1").status, EngineStatus::KeyNotFound);
}

#[test]
fn test_set_wakes_idle_flusher() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path())
        .flusher_idle_wait(Duration::from_secs(30))
        .build();
    let store = EpStore::open(config).unwrap();
    store.set_vbucket_state(0, VBucketStateKind::Active);

    // Let the flusher find an empty queue and go idle
    thread::sleep(Duration::from_millis(200));
    assert_eq!(store.set(&item("k", "v")), EngineStatus::Success);

    let start = Instant::now();
    assert!(wait_until(|| store.kvstore(0).get(b"k", 0).status == EngineStatus::Success));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_get_returns_latest_value() {
    let (_dir, store) = setup_temp_store();

    store.set(&item("k", "first"));
    store.set(&item("k", "second"));

    assert_eq!(value_of(&store, 0, "k"), Some(b"second".to_vec()));
    assert_eq!(store.get(0, b"missing").status, EngineStatus::KeyNotFound);
}

#[test]
fn test_cas_mismatch_is_rejected() {
    let (_dir, store) = setup_temp_store();
    store.set(&item("k", "v"));
    let cas = store.get(0, b"k").item.unwrap().cas;

    assert_eq!(store.set(&item("k", "x").with_cas(cas + 1)), EngineStatus::KeyExists);
    assert_eq!(store.set(&item("k", "y").with_cas(cas)), EngineStatus::Success);
    assert_eq!(store.del(0, b"k", cas), EngineStatus::KeyExists);
    assert_eq!(store.del(0, b"absent", 0), EngineStatus::KeyNotFound);
}

#[test]
fn test_inactive_vbucket_is_not_mine() {
    let (_dir, store) = setup_temp_store();

    assert_eq!(store.set(&item("k", "v").with_vbucket(1)), EngineStatus::NotMyVbucket);

    store.set_vbucket_state(1, VBucketStateKind::Replica);
    assert_eq!(store.set(&item("k", "v").with_vbucket(1)), EngineStatus::NotMyVbucket);
    assert_eq!(store.get(1, b"k").status, EngineStatus::NotMyVbucket);
    assert_eq!(store.del(1, b"k", 0), EngineStatus::NotMyVbucket);

    assert_eq!(store.engine_stats().num_not_my_vbuckets.value(), 4);
}

#[test]
fn test_set_beyond_quota_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let store = EpStore::open(test_config(temp_dir.path()).max_size(1024).build()).unwrap();
    store.set_vbucket_state(0, VBucketStateKind::Active);

    let big = "x".repeat(4096);
    assert_eq!(store.set(&item("big", &big)), EngineStatus::NoMemory);
    assert_eq!(store.engine_stats().tmp_oom_errors.value(), 1);
    assert_eq!(store.get(0, b"big").status, EngineStatus::KeyNotFound);
}

#[test]
fn test_expired_item_reads_as_missing() {
    let (_dir, store, clock) = setup_with_clock();
    store.set(&item("ttl", "v").with_expiry(10));
    assert!(value_of(&store, 0, "ttl").is_some());

    clock.set(20);

    assert_eq!(store.get(0, b"ttl").status, EngineStatus::KeyNotFound);
    let vb = store.vbucket(0).unwrap();
    let tombstone = vb.ht.find(b"ttl", TrackReference::No, WantsDeleted::Yes);
    assert!(tombstone.map_or(true, |v| v.is_deleted()));
}

#[test]
fn test_open_rejects_bad_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).max_num_shards(0).build();
    assert!(matches!(EpStore::open(config), Err(EpError::Config(_))));

    let config = test_config(temp_dir.path()).watermarks(100, 10).build();
    assert!(matches!(EpStore::open(config), Err(EpError::Config(_))));
}

// =============================================================================
// Warmup Tests
// =============================================================================

#[test]
fn test_warmup_restores_items_and_state() {
    let temp_dir = TempDir::new().unwrap();
    let high_seqno = {
        let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
        store.set_vbucket_state(0, VBucketStateKind::Active);
        store.set_vbucket_state(3, VBucketStateKind::Replica);
        for i in 0..10 {
            store.set(&item(&format!("key_{i}"), &format!("value_{i}")));
        }
        store.del(0, b"key_9", 0);
        let high_seqno = store.vbucket(0).unwrap().high_seqno();
        store.shutdown().unwrap();
        high_seqno
    };

    let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
    let vb = store.vbucket(0).unwrap();
    assert_eq!(vb.state(), VBucketStateKind::Active);
    assert_eq!(vb.high_seqno(), high_seqno);
    assert_eq!(vb.persisted_seqno(), high_seqno);
    assert_eq!(store.vbucket(3).unwrap().state(), VBucketStateKind::Replica);

    for i in 0..9 {
        assert_eq!(
            value_of(&store, 0, &format!("key_{i}")),
            Some(format!("value_{i}").into_bytes())
        );
    }
    assert_eq!(store.get(0, b"key_9").status, EngineStatus::KeyNotFound);

    // New mutations continue the seqno sequence
    store.set(&item("after", "v"));
    assert_eq!(vb.high_seqno(), high_seqno + 1);
}

#[test]
fn test_warmup_skips_keys_already_resident() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
        store.set_vbucket_state(0, VBucketStateKind::Active);
        store.set(&item("k", "persisted"));
        store.shutdown().unwrap();
    }

    let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
    store.set(&item("k", "newer"));

    assert_eq!(store.warmup().unwrap(), 0);
    assert_eq!(value_of(&store, 0, "k"), Some(b"newer".to_vec()));
}

// =============================================================================
// Ejection & Background Fetch Tests
// =============================================================================

#[test]
fn test_evict_then_fetch_value() {
    let (_dir, store) = setup_temp_store();
    pause_flusher(&store);
    store.set(&item("k", "v"));

    assert_eq!(
        store.evict_key(0, b"k"),
        (EngineStatus::KeyExists, "Can't eject: Dirty object.")
    );
    store.flush(false).unwrap();
    assert_eq!(store.evict_key(0, b"k"), (EngineStatus::Success, "Ejected."));
    assert_eq!(store.evict_key(0, b"k"), (EngineStatus::Success, "Already ejected."));
    assert_eq!(store.evict_key(0, b"nope"), (EngineStatus::KeyNotFound, "Not found."));

    let got = store.get_blocking(0, b"k", WAIT);
    assert_eq!(got.status, EngineStatus::Success);
    assert_eq!(got.item.unwrap().value.unwrap().to_vec(), b"v".to_vec());
    assert_eq!(store.engine_stats().bg_fetched.value(), 1);

    // Resident again: no fetch needed
    assert_eq!(store.get(0, b"k").status, EngineStatus::Success);
}

#[test]
fn test_get_of_ejected_value_would_block() {
    let (_dir, store) = setup_temp_store();
    pause_flusher(&store);
    store.set(&item("k", "v"));
    store.flush(false).unwrap();
    store.evict_key(0, b"k");

    assert_eq!(store.get(0, b"k").status, EngineStatus::WouldBlock);
    assert!(wait_until(|| store.get(0, b"k").status == EngineStatus::Success));
}

#[test]
fn test_full_eviction_fetches_whole_item() {
    let (_dir, store) = setup_full_eviction();
    pause_flusher(&store);
    store.set(&item("k", "v").with_flags(7));
    store.flush(false).unwrap();

    assert_eq!(store.evict_key(0, b"k"), (EngineStatus::Success, "Ejected."));
    let vb = store.vbucket(0).unwrap();
    assert!(vb.ht.find(b"k", TrackReference::No, WantsDeleted::Yes).is_none());

    let got = store.get_blocking(0, b"k", WAIT);
    assert_eq!(got.status, EngineStatus::Success);
    let fetched = got.item.unwrap();
    assert_eq!(fetched.flags, 7);
    assert_eq!(fetched.value.unwrap().to_vec(), b"v".to_vec());
}

#[test]
fn test_full_eviction_missing_key_is_remembered() {
    let (_dir, store) = setup_full_eviction();

    assert_eq!(store.get(0, b"ghost").status, EngineStatus::WouldBlock);
    assert_eq!(
        store.get_blocking(0, b"ghost", WAIT).status,
        EngineStatus::KeyNotFound
    );

    // The negative result is cached as a temp item
    assert!(wait_until(|| store.get(0, b"ghost").status == EngineStatus::KeyNotFound));
    let vb = store.vbucket(0).unwrap();
    assert!(vb.ht.num_temp_items() >= 1);
}

// =============================================================================
// Vbucket Lifecycle Tests
// =============================================================================

#[test]
fn test_set_vbucket_state_tracks_failover() {
    let (_dir, store) = setup_temp_store();
    assert_eq!(store.set_vbucket_state(2, VBucketStateKind::Replica), EngineStatus::Success);
    let vb = store.vbucket(2).unwrap();
    let before = vb.failover_log().len();

    store.set_vbucket_state(2, VBucketStateKind::Active);
    assert_eq!(vb.state(), VBucketStateKind::Active);
    assert_eq!(vb.failover_log().len(), before + 1);

    // Re-asserting the same state adds nothing
    store.set_vbucket_state(2, VBucketStateKind::Active);
    assert_eq!(vb.failover_log().len(), before + 1);

    assert_eq!(store.set_vbucket_state(8, VBucketStateKind::Active), EngineStatus::NotMyVbucket);
}

#[test]
fn test_vbucket_state_is_persisted() {
    let (_dir, store) = setup_temp_store();
    store.set_vbucket_state(4, VBucketStateKind::Pending);

    assert!(wait_until(|| {
        store.kvstore(4).list_persisted_vbuckets()[4]
            .as_ref()
            .is_some_and(|s| s.state == VBucketStateKind::Pending)
    }));
}

#[test]
fn test_delete_vbucket_removes_file() {
    let (_dir, store) = setup_temp_store();
    store.set_vbucket_state(2, VBucketStateKind::Active);
    store.set(&item("k", "v").with_vbucket(2));
    store.flush(false).unwrap();
    assert!(store.kvstore(2).db_file_info(2).is_ok());

    assert_eq!(store.delete_vbucket(2), EngineStatus::Success);
    assert!(store.vbucket(2).is_none());
    assert_eq!(store.get(2, b"k").status, EngineStatus::NotMyVbucket);
    assert!(wait_until(|| store.kvstore(2).db_file_info(2).is_err()));

    assert_eq!(store.delete_vbucket(2), EngineStatus::NotMyVbucket);
}

#[test]
fn test_compaction_purges_tombstones() {
    let (_dir, store) = setup_temp_store();
    pause_flusher(&store);
    for key in ["a", "b", "c"] {
        store.set(&item(key, "v"));
    }
    store.flush(false).unwrap();
    store.del(0, b"a", 0);
    store.del(0, b"b", 0);
    store.flush(false).unwrap();
    let before = store.kvstore(0).db_file_info(0).unwrap();
    assert_eq!(before.deleted_count, 2);

    let config = CompactionConfig {
        drop_deletes: true,
        ..Default::default()
    };
    store.compact_now(0, config).unwrap();

    let after = store.kvstore(0).db_file_info(0).unwrap();
    assert_eq!(after.deleted_count, 0);
    assert_eq!(after.doc_count, 1);
    assert!(after.file_size < before.file_size);
    assert_eq!(value_of(&store, 0, "c"), Some(b"v".to_vec()));

    assert!(matches!(
        store.compact_now(5, CompactionConfig::default()),
        Err(EpError::NotMyVbucket(5))
    ));
    assert_eq!(store.compact(5, CompactionConfig::default()), EngineStatus::NotMyVbucket);
}

#[test]
fn test_rollback_restores_earlier_values() {
    let (_dir, store) = setup_temp_store();
    pause_flusher(&store);
    store.set(&item("a", "old"));
    store.flush(false).unwrap();
    store.set(&item("b", "new"));
    store.set(&item("a", "newer"));
    store.flush(false).unwrap();
    let vb = store.vbucket(0).unwrap();
    assert_eq!(vb.high_seqno(), 3);
    let failovers = vb.failover_log().len();

    let result = store.rollback(0, 1).unwrap();

    assert!(result.success);
    assert_eq!(result.high_seqno, 1);
    assert_eq!(vb.high_seqno(), 1);
    assert_eq!(value_of(&store, 0, "a"), Some(b"old".to_vec()));
    assert_eq!(store.get(0, b"b").status, EngineStatus::KeyNotFound);
    assert_eq!(vb.failover_log().len(), failovers + 1);

    assert!(matches!(store.rollback(6, 0), Err(EpError::NotMyVbucket(6))));
}

// =============================================================================
// Stats & Shutdown Tests
// =============================================================================

#[test]
fn test_stats_report_engine_and_store() {
    let (_dir, store) = setup_temp_store();
    store.set_vbucket_state(1, VBucketStateKind::Replica);
    store.set(&item("a", "1"));
    store.set(&item("b", "2"));
    store.del(0, b"b", 0);

    let stats = collect_stats(&store);
    assert_eq!(stats["curr_items"], "1");
    assert_eq!(stats["vb_active_num"], "1");
    assert_eq!(stats["vb_replica_num"], "1");
    assert_eq!(stats["vb_dead_num"], "0");
    assert_eq!(stats["ep_flusher_state"], "running");
    assert_eq!(stats["ep_max_size"], store.config().max_size.to_string());
    assert!(stats.contains_key("mem_used"));
    assert!(stats.contains_key("rw_0:failure_get"));
    assert!(stats.contains_key("rw_1:failure_get"));
}

#[test]
fn test_shutdown_persists_and_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = EpStore::open(test_config(temp_dir.path()).build()).unwrap();
    store.set_vbucket_state(0, VBucketStateKind::Active);
    for i in 0..50 {
        store.set(&item(&format!("key_{i}"), "v"));
    }

    store.shutdown().unwrap();
    store.shutdown().unwrap();
    assert!(store.pool().is_shutdown());
    assert_eq!(collect_stats(&store)["ep_flusher_state"], "stopped");

    for i in 0..50 {
        let key = format!("key_{i}");
        assert_eq!(
            store.kvstore(0).get(key.as_bytes(), 0).status,
            EngineStatus::Success
        );
    }
}

#[test]
fn test_maintenance_after_shutdown_is_refused() {
    let (_dir, store) = setup_temp_store();
    store.set(&item("k", "v"));
    store.shutdown().unwrap();

    assert!(matches!(store.flush(false), Err(EpError::Shutdown)));
    assert!(matches!(
        store.compact_now(0, CompactionConfig::default()),
        Err(EpError::Shutdown)
    ));
    assert!(matches!(store.rollback(0, 0), Err(EpError::Shutdown)));
    assert_eq!(store.compact(0, CompactionConfig::default()), EngineStatus::TempFail);
    assert_eq!(store.delete_vbucket(0), EngineStatus::TempFail);
    assert!(store.vbucket(0).is_some());
}

#[test]
fn test_concurrent_writers_on_separate_vbuckets() {
    let (_dir, store) = setup_temp_store();
    for vbid in 1..4 {
        store.set_vbucket_state(vbid, VBucketStateKind::Active);
    }
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4u16)
        .map(|vbid| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let it = item(&format!("key_{i}"), &format!("{vbid}")).with_vbucket(vbid);
                    assert_eq!(store.set(&it), EngineStatus::Success);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    store.flush(false).unwrap();
    for vbid in 0..4u16 {
        assert_eq!(value_of(&store, vbid, "key_42"), Some(vbid.to_string().into_bytes()));
        assert_eq!(store.vbucket(vbid).unwrap().high_seqno(), 100);
    }
}
