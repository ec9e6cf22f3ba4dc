//! File KvStore Tests
//!
//! Tests verify:
//! - Transactions: commit fires callbacks, rollback_txn discards
//! - Point reads, tombstones and batched reads
//! - Recovery: reopen, torn tails, vbucket state snapshots
//! - Scans with filters, cache lookups and pauses
//! - Compaction, rollback and vbucket deletion
//! - Injected I/O failures

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver};
use epkv::kvstore::{
    CacheLookup, CacheLookupKey, CompactionCtx, DefaultFileOps, DocumentFilter, FileKvStore,
    FileKvStoreConfig, FileOps, GetValue, KvStore, RollbackItem, ScanControl, ScanStatus,
    SetCallback, VBStatePersist, VBucketState, ValueFilter,
};
use epkv::{Config, EngineStatus, Item, VBucketStateKind};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// File operations that fail on demand
#[derive(Default)]
struct FaultyFileOps {
    fail_writes: AtomicBool,
    fail_syncs: AtomicBool,
}

impl FileOps for FaultyFileOps {
    fn open(&self, path: &Path, create: bool) -> io::Result<std::fs::File> {
        DefaultFileOps.open(path, create)
    }

    fn read_at(&self, file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        DefaultFileOps.read_at(file, offset, buf)
    }

    fn write_at(&self, file: &mut std::fs::File, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        DefaultFileOps.write_at(file, offset, buf)
    }

    fn sync(&self, file: &mut std::fs::File) -> io::Result<()> {
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        DefaultFileOps.sync(file)
    }

    fn truncate(&self, file: &mut std::fs::File, len: u64) -> io::Result<()> {
        DefaultFileOps.truncate(file, len)
    }

    fn len(&self, file: &mut std::fs::File) -> io::Result<u64> {
        DefaultFileOps.len(file)
    }
}

/// Records the largest single read
#[derive(Default)]
struct ReadSizeFileOps {
    largest_read: AtomicUsize,
}

impl FileOps for ReadSizeFileOps {
    fn open(&self, path: &Path, create: bool) -> io::Result<std::fs::File> {
        DefaultFileOps.open(path, create)
    }

    fn read_at(&self, file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.largest_read.fetch_max(buf.len(), Ordering::SeqCst);
        DefaultFileOps.read_at(file, offset, buf)
    }

    fn write_at(&self, file: &mut std::fs::File, offset: u64, buf: &[u8]) -> io::Result<()> {
        DefaultFileOps.write_at(file, offset, buf)
    }

    fn sync(&self, file: &mut std::fs::File) -> io::Result<()> {
        DefaultFileOps.sync(file)
    }

    fn truncate(&self, file: &mut std::fs::File, len: u64) -> io::Result<()> {
        DefaultFileOps.truncate(file, len)
    }

    fn len(&self, file: &mut std::fs::File) -> io::Result<u64> {
        DefaultFileOps.len(file)
    }
}

fn store_config(dir: &Path) -> FileKvStoreConfig {
    let config = Config::builder()
        .data_dir(dir)
        .max_vbuckets(4)
        .max_num_shards(1)
        .build();
    FileKvStoreConfig::from_config(&config, 0)
}

fn setup_temp_store() -> (TempDir, FileKvStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    (temp_dir, store)
}

fn doc(key: &str, value: &str, seqno: u64) -> Item {
    Item::new(key.as_bytes().to_vec(), value.as_bytes().to_vec())
        .with_cas(seqno * 10)
        .with_seqno(seqno)
}

/// Callback reporting into a channel
fn recorder() -> (impl Fn() -> SetCallback, Receiver<bool>) {
    let (tx, rx) = channel::unbounded();
    (
        move || {
            let tx = tx.clone();
            Box::new(move |ok| {
                let _ = tx.send(ok);
            }) as SetCallback
        },
        rx,
    )
}

fn commit_docs(store: &FileKvStore, items: &[Item]) -> Vec<bool> {
    let (cb, rx) = recorder();
    assert!(store.begin());
    for item in items {
        if item.deleted {
            store.del(item, cb());
        } else {
            store.set(item, cb());
        }
    }
    store.commit();
    rx.try_iter().collect()
}

fn value_of(result: &GetValue) -> Option<&[u8]> {
    result.item.as_ref()?.value.as_deref()
}

fn scan_keys(store: &FileKvStore, filter: DocumentFilter) -> Vec<(Vec<u8>, bool)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut ctx = store
        .init_scan_context(
            Box::new(move |gv: GetValue| {
                let item = gv.item.unwrap();
                sink.lock().push((item.key, item.deleted));
                ScanControl::Continue
            }),
            Box::new(|_: &CacheLookupKey| CacheLookup::Fetch),
            0,
            0,
            filter,
            ValueFilter::Values,
        )
        .unwrap();
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan_context(ctx);
    let keys = seen.lock().clone();
    keys
}

fn stat(store: &FileKvStore, name: &str) -> String {
    let mut found = None;
    store.add_stats(&mut |k, v| {
        if k == name {
            found = Some(v.to_string());
        }
    });
    found.unwrap_or_else(|| panic!("missing stat {name}"))
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[test]
fn test_commit_fires_callbacks_and_persists() {
    let (_dir, store) = setup_temp_store();

    let results = commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2)]);
    assert_eq!(results, vec![true, true]);

    let got = store.get(b"a", 0);
    assert_eq!(got.status, EngineStatus::Success);
    assert_eq!(value_of(&got), Some(&b"1"[..]));
    assert_eq!(got.item.as_ref().unwrap().cas, 10);
    assert_eq!(store.high_seqno(0), 2);
    assert_eq!(stat(&store, "rw_0:io_num_write"), "2");
}

#[test]
fn test_callbacks_wait_for_commit() {
    let (_dir, store) = setup_temp_store();
    let (cb, rx) = recorder();

    assert!(store.begin());
    store.set(&doc("a", "1", 1), cb());
    assert!(rx.try_recv().is_err());
    assert!(store.commit());
    assert_eq!(rx.try_recv(), Ok(true));
}

#[test]
fn test_second_begin_is_refused() {
    let (_dir, store) = setup_temp_store();
    assert!(store.begin());
    assert!(!store.begin());
    assert!(store.commit());
    assert!(store.begin());
}

#[test]
fn test_write_without_transaction_fails() {
    let (_dir, store) = setup_temp_store();
    let (cb, rx) = recorder();
    store.set(&doc("a", "1", 1), cb());
    assert_eq!(rx.try_recv(), Ok(false));
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);
}

#[test]
fn test_rollback_txn_discards_writes() {
    let (_dir, store) = setup_temp_store();
    let (cb, rx) = recorder();

    store.begin();
    store.set(&doc("a", "1", 1), cb());
    store.rollback_txn();

    assert_eq!(rx.try_recv(), Ok(false));
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);
    assert!(store.begin());
}

#[test]
fn test_write_for_foreign_vbucket_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_vbuckets(4)
        .max_num_shards(2)
        .build();
    let store = FileKvStore::open(FileKvStoreConfig::from_config(&config, 0)).unwrap();

    let results = commit_docs(&store, &[doc("a", "1", 1).with_vbucket(1)]);
    assert_eq!(results, vec![false]);
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_tombstone_reads_as_not_found_with_metadata() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1)]);
    let tombstone = Item::deletion(b"a".to_vec(), 0).with_cas(99).with_seqno(2);
    assert_eq!(commit_docs(&store, &[tombstone]), vec![true]);

    let got = store.get(b"a", 0);
    assert_eq!(got.status, EngineStatus::KeyNotFound);
    let item = got.item.unwrap();
    assert!(item.deleted);
    assert_eq!(item.cas, 99);
    assert_eq!(item.by_seqno, 2);
}

#[test]
fn test_get_multi_answers_in_key_order() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1), doc("c", "3", 2)]);

    let keys = vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()];
    let results = store.get_multi(0, &keys);
    assert_eq!(results.len(), 3);
    assert_eq!(value_of(&results[0]), Some(&b"3"[..]));
    assert_eq!(results[1].status, EngineStatus::KeyNotFound);
    assert_eq!(value_of(&results[2]), Some(&b"1"[..]));
}

#[test]
fn test_get_on_unknown_vbucket_is_not_found() {
    let (_dir, store) = setup_temp_store();
    assert_eq!(store.get(b"a", 3).status, EngineStatus::KeyNotFound);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_reopen_reloads_committed_documents() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2)]);
        commit_docs(&store, &[doc("a", "updated", 3)]);
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"updated"[..]));
    assert_eq!(value_of(&store.get(b"b", 0)), Some(&b"2"[..]));
    assert_eq!(store.high_seqno(0), 3);
    assert_eq!(stat(&store, "rw_0:numLoadedVb"), "1");
}

#[test]
fn test_torn_tail_is_discarded_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        commit_docs(&store, &[doc("a", "1", 1)]);
        store.file_path(0).unwrap()
    };
    let committed_len = std::fs::metadata(&path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 0, 0, 0, 40, 0xde, 0xad]).unwrap();
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"1"[..]));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), committed_len);
}

#[test]
fn test_reopen_streams_file_in_small_reads() {
    let temp_dir = TempDir::new().unwrap();
    let path = {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        let docs: Vec<Item> = (0..2_000)
            .map(|i| doc(&format!("key_{i:05}"), "value", i + 1))
            .collect();
        commit_docs(&store, &docs);
        store.file_path(0).unwrap()
    };
    let file_len = std::fs::metadata(&path).unwrap().len();
    assert!(file_len > 64 * 1024);

    let ops = Arc::new(ReadSizeFileOps::default());
    let store = FileKvStore::with_file_ops(store_config(temp_dir.path()), ops.clone()).unwrap();
    assert_eq!(value_of(&store.get(b"key_01999", 0)), Some(&b"value"[..]));
    assert!(ops.largest_read.load(Ordering::SeqCst) <= 64 * 1024);
}

#[test]
fn test_oversized_frame_length_is_treated_as_torn_tail() {
    let temp_dir = TempDir::new().unwrap();
    let path = {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        commit_docs(&store, &[doc("a", "1", 1)]);
        store.file_path(0).unwrap()
    };
    let committed_len = std::fs::metadata(&path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 7, 7]).unwrap();
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"1"[..]));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), committed_len);
}

#[test]
fn test_vbucket_state_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let mut state = VBucketState::new(VBucketStateKind::Replica);
    state.high_seqno = 42;
    state.max_cas = 1234;
    {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        assert!(store.snapshot_vbucket(2, &state, VBStatePersist::PersistWithCommit));
        assert!(store.snapshot_vbucket(
            0,
            &VBucketState::new(VBucketStateKind::Active),
            VBStatePersist::CacheUpdateOnly
        ));
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    let persisted = store.list_persisted_vbuckets();
    assert_eq!(persisted.len(), 4);
    assert_eq!(persisted[2].as_ref(), Some(&state));
    assert!(persisted[0].is_none());
}

#[test]
fn test_all_ones_max_cas_is_repaired_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let mut state = VBucketState::new(VBucketStateKind::Active);
    state.max_cas = u64::MAX;
    {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        store.snapshot_vbucket(1, &state, VBStatePersist::PersistWithCommit);
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    let loaded = store.list_persisted_vbuckets()[1].clone().unwrap();
    assert_eq!(loaded.max_cas, 0);
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_scan_respects_document_filter() {
    let (_dir, store) = setup_temp_store();
    commit_docs(
        &store,
        &[
            doc("a", "1", 1),
            doc("b", "2", 2),
            Item::deletion(b"a".to_vec(), 0).with_seqno(3),
        ],
    );

    assert_eq!(
        scan_keys(&store, DocumentFilter::AllItems),
        vec![(b"b".to_vec(), false), (b"a".to_vec(), true)]
    );
    assert_eq!(
        scan_keys(&store, DocumentFilter::NoDeletes),
        vec![(b"b".to_vec(), false)]
    );
}

#[test]
fn test_scan_keys_only_and_lookup_skip() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2), doc("c", "3", 3)]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut ctx = store
        .init_scan_context(
            Box::new(move |gv: GetValue| {
                let item = gv.item.unwrap();
                assert!(item.value.is_none());
                sink.lock().push(item.key);
                ScanControl::Continue
            }),
            Box::new(|key: &CacheLookupKey| {
                if key.key == b"b" {
                    CacheLookup::Skip
                } else {
                    CacheLookup::Fetch
                }
            }),
            0,
            0,
            DocumentFilter::AllItems,
            ValueFilter::KeysOnly,
        )
        .unwrap();
    assert_eq!(ctx.max_seqno, 3);
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan_context(ctx);

    assert_eq!(*seen.lock(), vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_scan_pause_resumes_at_same_document() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2), doc("c", "3", 3)]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut paused_once = false;
    let mut ctx = store
        .init_scan_context(
            Box::new(move |gv: GetValue| {
                let item = gv.item.unwrap();
                if item.key == b"b" && !paused_once {
                    paused_once = true;
                    return ScanControl::Pause;
                }
                sink.lock().push(item.key);
                ScanControl::Continue
            }),
            Box::new(|_: &CacheLookupKey| CacheLookup::Fetch),
            0,
            0,
            DocumentFilter::AllItems,
            ValueFilter::Values,
        )
        .unwrap();

    assert_eq!(store.scan(&mut ctx), ScanStatus::Again);
    assert_eq!(ctx.last_read_seqno, 1);
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan_context(ctx);
    assert_eq!(*seen.lock(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_scan_of_missing_vbucket_has_no_context() {
    let (_dir, store) = setup_temp_store();
    let ctx = store.init_scan_context(
        Box::new(|_: GetValue| ScanControl::Continue),
        Box::new(|_: &CacheLookupKey| CacheLookup::Fetch),
        1,
        0,
        DocumentFilter::AllItems,
        ValueFilter::Values,
    );
    assert!(ctx.is_none());
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compaction_drops_deletes_and_bumps_revision() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2)]);
    commit_docs(&store, &[Item::deletion(b"a".to_vec(), 0).with_seqno(3)]);
    let old_path = store.file_path(0).unwrap();
    let old_revision = store.revision(0).unwrap();

    let mut ctx = CompactionCtx {
        drop_deletes: true,
        ..Default::default()
    };
    assert!(store.compact_db(0, &mut ctx));

    assert_eq!(ctx.max_purged_seq, 3);
    assert_eq!(store.revision(0), Some(old_revision + 1));
    assert!(!old_path.exists());
    assert!(store.get(b"a", 0).item.is_none());
    assert_eq!(value_of(&store.get(b"b", 0)), Some(&b"2"[..]));
    let info = store.db_file_info(0).unwrap();
    assert_eq!(info.doc_count, 1);
    assert_eq!(info.deleted_count, 0);
    assert_eq!(store.high_seqno(0), 3);
}

#[test]
fn test_compaction_keeps_recent_tombstones() {
    let (_dir, store) = setup_temp_store();
    let tombstone = Item::deletion(b"a".to_vec(), 0)
        .with_expiry(500)
        .with_seqno(1);
    commit_docs(&store, &[tombstone]);

    let mut ctx = CompactionCtx {
        purge_before_ts: 100,
        ..Default::default()
    };
    assert!(store.compact_db(0, &mut ctx));
    assert_eq!(ctx.max_purged_seq, 0);
    assert!(store.get(b"a", 0).item.unwrap().deleted);

    let mut ctx = CompactionCtx {
        purge_before_ts: 1000,
        ..Default::default()
    };
    assert!(store.compact_db(0, &mut ctx));
    assert_eq!(ctx.max_purged_seq, 1);
    assert!(store.get(b"a", 0).item.is_none());
}

#[test]
fn test_compaction_reports_expired_documents() {
    let (_dir, store) = setup_temp_store();
    commit_docs(
        &store,
        &[
            doc("old", "x", 1).with_expiry(50),
            doc("fresh", "y", 2).with_expiry(500),
            doc("forever", "z", 3),
        ],
    );

    let mut ctx = CompactionCtx {
        curr_time: 100,
        ..Default::default()
    };
    assert!(store.compact_db(0, &mut ctx));
    let expired: Vec<_> = ctx.expired_items.iter().map(|i| i.key.clone()).collect();
    assert_eq!(expired, vec![b"old".to_vec()]);
    // Expired documents stay until the engine deletes them
    assert_eq!(store.get(b"old", 0).status, EngineStatus::Success);
}

#[test]
fn test_compaction_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
        commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2)]);
        commit_docs(&store, &[Item::deletion(b"b".to_vec(), 0).with_seqno(3)]);
        let mut ctx = CompactionCtx {
            drop_deletes: true,
            ..Default::default()
        };
        assert!(store.compact_db(0, &mut ctx));
    }

    let store = FileKvStore::open(store_config(temp_dir.path())).unwrap();
    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"1"[..]));
    assert!(store.get(b"b", 0).item.is_none());
    assert_eq!(store.revision(0), Some(2));
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_reports_changed_keys() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1), doc("b", "2", 2)]);
    commit_docs(&store, &[doc("a", "new", 3), doc("c", "3", 4)]);

    let mut changed: Vec<RollbackItem> = Vec::new();
    let result = store.rollback(0, 2, &mut |item| changed.push(item));

    assert!(result.success);
    assert_eq!(result.high_seqno, 2);
    changed.sort_by(|x, y| x.key.cmp(&y.key));
    assert_eq!(changed.len(), 2);
    assert_eq!(changed[0].key, b"a".to_vec());
    assert_eq!(
        changed[0].item.as_ref().and_then(|i| i.value.as_deref()),
        Some(&b"1"[..])
    );
    assert_eq!(changed[1].key, b"c".to_vec());
    assert!(changed[1].item.is_none());

    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"1"[..]));
    assert_eq!(store.get(b"c", 0).status, EngineStatus::KeyNotFound);
    assert_eq!(store.high_seqno(0), 2);
}

#[test]
fn test_rollback_without_commit_point_fails() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 5)]);

    let result = store.rollback(0, 2, &mut |_| panic!("no keys expected"));
    assert!(!result.success);
}

// =============================================================================
// VBucket File Lifecycle Tests
// =============================================================================

#[test]
fn test_del_vbucket_then_recreate_uses_new_revision() {
    let (_dir, store) = setup_temp_store();
    commit_docs(&store, &[doc("a", "1", 1)]);
    let first = store.revision(0).unwrap();
    let first_path = store.file_path(0).unwrap();

    assert!(store.del_vbucket(0));
    assert!(!first_path.exists());
    assert!(store.db_file_info(0).is_err());
    assert!(!store.del_vbucket(0));

    commit_docs(&store, &[doc("b", "2", 1)]);
    assert!(store.revision(0).unwrap() > first);
    assert_eq!(store.get(b"a", 0).status, EngineStatus::KeyNotFound);
}

#[test]
fn test_increment_revision_applies_to_next_file() {
    let (_dir, store) = setup_temp_store();
    store.increment_revision(1);
    store.increment_revision(1);
    assert!(store.snapshot_vbucket(
        1,
        &VBucketState::new(VBucketStateKind::Active),
        VBStatePersist::PersistWithCommit
    ));
    assert_eq!(store.revision(1), Some(3));
}

// =============================================================================
// Fault Injection Tests
// =============================================================================

#[test]
fn test_injected_write_failure_fails_commit() {
    let temp_dir = TempDir::new().unwrap();
    let ops = Arc::new(FaultyFileOps::default());
    let store = FileKvStore::with_file_ops(store_config(temp_dir.path()), ops.clone()).unwrap();
    commit_docs(&store, &[doc("a", "1", 1)]);

    ops.fail_writes.store(true, Ordering::SeqCst);
    let (cb, rx) = recorder();
    store.begin();
    store.set(&doc("b", "2", 2), cb());
    store.del(&Item::deletion(b"a".to_vec(), 0).with_seqno(3), cb());
    assert!(!store.commit());
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![false, false]);
    assert_eq!(stat(&store, "rw_0:failure_set"), "1");
    assert_eq!(stat(&store, "rw_0:failure_del"), "1");

    // Nothing from the failed commit is visible, and the store recovers
    assert_eq!(store.get(b"b", 0).status, EngineStatus::KeyNotFound);
    ops.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(commit_docs(&store, &[doc("b", "2", 2)]), vec![true]);
    assert_eq!(value_of(&store.get(b"b", 0)), Some(&b"2"[..]));
    assert_eq!(value_of(&store.get(b"a", 0)), Some(&b"1"[..]));
}

#[test]
fn test_injected_sync_failure_fails_state_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let ops = Arc::new(FaultyFileOps::default());
    let store = FileKvStore::with_file_ops(store_config(temp_dir.path()), ops.clone()).unwrap();
    commit_docs(&store, &[doc("a", "1", 1)]);

    ops.fail_syncs.store(true, Ordering::SeqCst);
    assert!(!store.snapshot_vbucket(
        0,
        &VBucketState::new(VBucketStateKind::Active),
        VBStatePersist::PersistWithCommit
    ));
    assert_eq!(stat(&store, "rw_0:failure_vbstate"), "1");
}

#[test]
fn test_stats_are_prefixed_by_shard() {
    let (_dir, store) = setup_temp_store();
    let mut names = Vec::new();
    store.add_stats(&mut |k, _| names.push(k.to_string()));
    assert!(names.iter().all(|n| n.starts_with("rw_0:")));
    assert!(names.contains(&"rw_0:io_total_write_bytes".to_string()));
    assert!(names.contains(&"rw_0:failure_compaction".to_string()));
}
