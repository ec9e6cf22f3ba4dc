//! Flusher Tests
//!
//! Tests verify:
//! - Transactions are bounded by txn_size and skipped when idle
//! - Repeated mutations of a key coalesce into one write
//! - Failed commits leave items dirty and re-queued
//! - Items re-dirtied while in flight are not marked clean
//! - A storage failure is reported exactly once in the log

use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use epkv::executor::ExecutorPool;
use epkv::flusher::{DirtyQueue, Flusher, FlusherState};
use epkv::hashtable::{TrackReference, WantsDeleted};
use epkv::kvstore::{
    CacheLookupCallback, CompactionCtx, DbFileInfo, DefaultFileOps, DelCallback, DocumentFilter,
    FileKvStore, FileKvStoreConfig, FileOps, GetValue, KvStore, RollbackItem, RollbackResult,
    ScanContext, ScanStatus, SetCallback, VBStatePersist, VBucketState, ValueCallback,
    ValueFilter,
};
use epkv::stats::EngineStats;
use epkv::time::{Clock, ManualClock};
use epkv::vbucket::{VBucket, VBucketMap};
use epkv::{Config, EpError, Item, VBucketStateKind};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

type Hook = Box<dyn FnOnce() + Send>;

/// In-memory store counting what the flusher asks of it
#[derive(Default)]
struct CountingStore {
    begins: AtomicUsize,
    commits: AtomicUsize,
    in_txn: AtomicBool,
    sets: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    dels: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<Vec<SetCallback>>,
    fail_next_commit: AtomicBool,
    before_callbacks: Mutex<Option<Hook>>,
}

impl KvStore for CountingStore {
    fn shard_id(&self) -> u16 {
        0
    }

    fn begin(&self) -> bool {
        self.begins.fetch_add(1, Ordering::SeqCst);
        !self.in_txn.swap(true, Ordering::SeqCst)
    }

    fn commit(&self) -> bool {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.in_txn.store(false, Ordering::SeqCst);
        let ok = !self.fail_next_commit.swap(false, Ordering::SeqCst);
        let callbacks = std::mem::take(&mut *self.pending.lock());
        if let Some(hook) = self.before_callbacks.lock().take() {
            hook();
        }
        for cb in callbacks {
            cb(ok);
        }
        ok
    }

    fn rollback_txn(&self) {
        self.in_txn.store(false, Ordering::SeqCst);
        for cb in std::mem::take(&mut *self.pending.lock()) {
            cb(false);
        }
    }

    fn set(&self, item: &Item, cb: SetCallback) {
        let value = item.value.as_ref().map(|v| v.to_vec()).unwrap_or_default();
        self.sets.lock().push((item.key.clone(), value));
        self.pending.lock().push(cb);
    }

    fn del(&self, item: &Item, cb: DelCallback) {
        self.dels.lock().push(item.key.clone());
        self.pending.lock().push(cb);
    }

    fn get(&self, _key: &[u8], _vbid: u16) -> GetValue {
        GetValue::not_found()
    }

    fn get_multi(&self, _vbid: u16, keys: &[Vec<u8>]) -> Vec<GetValue> {
        keys.iter().map(|_| GetValue::not_found()).collect()
    }

    fn init_scan_context(
        &self,
        _value_cb: ValueCallback,
        _lookup_cb: CacheLookupCallback,
        _vbid: u16,
        _start_seqno: u64,
        _document_filter: DocumentFilter,
        _value_filter: ValueFilter,
    ) -> Option<ScanContext> {
        None
    }

    fn scan(&self, _ctx: &mut ScanContext) -> ScanStatus {
        ScanStatus::Success
    }

    fn destroy_scan_context(&self, _ctx: ScanContext) {}

    fn compact_db(&self, _vbid: u16, _ctx: &mut CompactionCtx) -> bool {
        true
    }

    fn rollback(
        &self,
        _vbid: u16,
        _rollback_seqno: u64,
        _cb: &mut dyn FnMut(RollbackItem),
    ) -> RollbackResult {
        RollbackResult::failed()
    }

    fn snapshot_vbucket(&self, _vbid: u16, _state: &VBucketState, _mode: VBStatePersist) -> bool {
        true
    }

    fn list_persisted_vbuckets(&self) -> Vec<Option<VBucketState>> {
        Vec::new()
    }

    fn del_vbucket(&self, _vbid: u16) -> bool {
        true
    }

    fn increment_revision(&self, _vbid: u16) {}

    fn db_file_info(&self, vbid: u16) -> epkv::Result<DbFileInfo> {
        Err(EpError::NoSuchFile(vbid))
    }

    fn add_stats(&self, _add_stat: &mut dyn FnMut(&str, &str)) {}
}

/// File operations whose writes fail on demand
#[derive(Default)]
struct FailingWrites {
    fail: AtomicBool,
}

impl FileOps for FailingWrites {
    fn open(&self, path: &Path, create: bool) -> io::Result<std::fs::File> {
        DefaultFileOps.open(path, create)
    }

    fn read_at(&self, file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        DefaultFileOps.read_at(file, offset, buf)
    }

    fn write_at(&self, file: &mut std::fs::File, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
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

/// Log sink shared between the subscriber and the test
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn lines_with(&self, level: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .filter(|line| line.contains(level))
            .count()
    }
}

struct Fixture {
    flusher: Arc<Flusher>,
    vb: Arc<VBucket>,
    queue: Arc<DirtyQueue>,
    stats: Arc<EngineStats>,
}

fn fixture(store: Arc<dyn KvStore>, txn_size: usize) -> Fixture {
    let config = Config::builder()
        .max_vbuckets(4)
        .max_num_shards(1)
        .txn_size(txn_size)
        .build();
    let stats = Arc::new(EngineStats::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1));
    let queue = Arc::new(DirtyQueue::new(stats.clone()));
    let vbuckets = Arc::new(VBucketMap::new(config.max_vbuckets));
    let vb = Arc::new(VBucket::new(
        0,
        VBucketStateKind::Active,
        &config,
        stats.clone(),
        clock.clone(),
        queue.clone(),
    ));
    vbuckets.insert(vb.clone());

    let flusher = Arc::new(Flusher::new(
        0,
        store,
        vbuckets,
        queue.clone(),
        stats.clone(),
        clock,
        &config,
    ));
    Fixture {
        flusher,
        vb,
        queue,
        stats,
    }
}

fn counting(txn_size: usize) -> (Arc<CountingStore>, Fixture) {
    let store = Arc::new(CountingStore::default());
    let fx = fixture(store.clone(), txn_size);
    (store, fx)
}

fn item(key: &str, value: &str) -> Item {
    Item::new(key.as_bytes().to_vec(), value.as_bytes().to_vec()).with_vbucket(0)
}

fn is_dirty(vb: &VBucket, key: &str) -> bool {
    vb.ht
        .find(key.as_bytes(), TrackReference::No, WantsDeleted::Yes)
        .map(|v| v.is_dirty())
        .unwrap()
}

// =============================================================================
// Batching Tests
// =============================================================================

#[test]
fn test_empty_queue_opens_no_transaction() {
    let (store, fx) = counting(10);

    assert_eq!(fx.flusher.flush(false).unwrap(), 0);
    assert_eq!(store.begins.load(Ordering::SeqCst), 0);
    assert_eq!(store.commits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_batches_are_bounded_by_txn_size() {
    let (store, fx) = counting(3);
    for i in 0..7 {
        fx.vb.set(&item(&format!("key_{i}"), "v"));
    }

    assert_eq!(fx.flusher.flush(false).unwrap(), 7);
    assert_eq!(store.begins.load(Ordering::SeqCst), 3);
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);
    assert_eq!(store.sets.lock().len(), 7);
    assert!(fx.queue.is_empty());
    assert_eq!(fx.stats.total_persisted.value(), 7);
    for i in 0..7 {
        assert!(!is_dirty(&fx.vb, &format!("key_{i}")));
    }
}

#[test]
fn test_repeated_mutations_coalesce() {
    let (store, fx) = counting(10);
    for i in 0..5 {
        fx.vb.set(&item("hot", &format!("v{i}")));
    }
    assert_eq!(fx.queue.len(), 1);

    assert_eq!(fx.flusher.flush(false).unwrap(), 1);
    assert_eq!(*store.sets.lock(), vec![(b"hot".to_vec(), b"v4".to_vec())]);
}

#[test]
fn test_clean_item_is_skipped() {
    let (store, fx) = counting(10);
    fx.vb.set(&item("k", "v"));
    fx.flusher.flush(false).unwrap();

    // Queued again without being re-dirtied
    fx.queue.push(0, b"k", 1);
    assert_eq!(fx.flusher.flush(false).unwrap(), 0);
    assert_eq!(store.begins.load(Ordering::SeqCst), 1);
    assert_eq!(fx.stats.flusher_skipped.value(), 1);
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[test]
fn test_delete_after_set_writes_only_tombstone() {
    let (store, fx) = counting(10);
    fx.vb.set(&item("k", "v"));
    fx.vb.soft_delete(b"k", 0);

    assert_eq!(fx.flusher.flush(false).unwrap(), 1);
    assert!(store.sets.lock().is_empty());
    assert_eq!(*store.dels.lock(), vec![b"k".to_vec()]);

    // The persisted tombstone leaves memory
    assert!(fx
        .vb
        .ht
        .find(b"k", TrackReference::No, WantsDeleted::Yes)
        .is_none());
}

#[test]
fn test_absent_key_is_written_as_delete() {
    let (store, fx) = counting(10);
    fx.queue.push(0, b"ghost", 1);

    assert_eq!(fx.flusher.flush(false).unwrap(), 1);
    assert_eq!(*store.dels.lock(), vec![b"ghost".to_vec()]);
}

#[test]
fn test_key_for_missing_vbucket_is_dropped() {
    let (store, fx) = counting(10);
    fx.queue.push(3, b"orphan", 1);

    assert_eq!(fx.flusher.flush(false).unwrap(), 0);
    assert_eq!(store.begins.load(Ordering::SeqCst), 0);
    assert!(fx.queue.is_empty());
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_commit_requeues_and_keeps_items_dirty() {
    let (store, fx) = counting(2);
    for key in ["a", "b", "c", "d"] {
        fx.vb.set(&item(key, "v"));
    }
    store.fail_next_commit.store(true, Ordering::SeqCst);

    match fx.flusher.flush(false) {
        Err(EpError::CommitFailed { pending }) => assert_eq!(pending, 4),
        other => panic!("expected commit failure, got {other:?}"),
    }
    assert_eq!(store.commits.load(Ordering::SeqCst), 1);
    assert_eq!(fx.queue.len(), 4);
    assert_eq!(fx.stats.flusher_commit_failed.value(), 2);
    for key in ["a", "b", "c", "d"] {
        assert!(is_dirty(&fx.vb, key));
    }

    assert_eq!(fx.flusher.flush(false).unwrap(), 4);
    assert!(fx.queue.is_empty());
    for key in ["a", "b", "c", "d"] {
        assert!(!is_dirty(&fx.vb, key));
    }
}

#[test]
fn test_redirtied_item_stays_dirty_and_is_requeued() {
    let (store, fx) = counting(10);
    fx.vb.set(&item("k", "old"));

    let vb = fx.vb.clone();
    *store.before_callbacks.lock() = Some(Box::new(move || {
        vb.set(&item("k", "new"));
    }));

    assert_eq!(fx.flusher.flush(false).unwrap(), 1);
    assert!(is_dirty(&fx.vb, "k"));
    assert_eq!(fx.queue.len(), 1);

    assert_eq!(fx.flusher.flush(false).unwrap(), 1);
    assert!(!is_dirty(&fx.vb, "k"));
    assert_eq!(store.sets.lock().last().unwrap().1, b"new".to_vec());
}

#[test]
fn test_storage_failure_logs_one_warning() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_vbuckets(4)
        .max_num_shards(1)
        .build();
    let ops = Arc::new(FailingWrites::default());
    let store = Arc::new(
        FileKvStore::with_file_ops(FileKvStoreConfig::from_config(&config, 0), ops.clone())
            .unwrap(),
    );
    let fx = fixture(store, 10);
    for key in ["a", "b", "c"] {
        fx.vb.set(&item(key, "v"));
    }

    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    ops.fail.store(true, Ordering::SeqCst);
    let result = tracing::subscriber::with_default(subscriber, || fx.flusher.flush(false));

    assert!(matches!(result, Err(EpError::CommitFailed { pending: 3 })));
    assert_eq!(logs.lines_with("WARN"), 1);

    ops.fail.store(false, Ordering::SeqCst);
    assert_eq!(fx.flusher.flush(false).unwrap(), 3);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_stop_drains_queue() {
    let (store, fx) = counting(10);
    let pool = ExecutorPool::new(1);

    assert!(fx.flusher.start(&pool));
    assert!(!fx.flusher.start(&pool));
    assert_eq!(fx.flusher.state(), FlusherState::Running);

    for i in 0..20 {
        fx.vb.set(&item(&format!("key_{i}"), "v"));
    }
    fx.flusher.stop(&pool).unwrap();

    assert_eq!(fx.flusher.state(), FlusherState::Stopped);
    assert!(fx.queue.is_empty());
    assert_eq!(store.sets.lock().len(), 20);
    assert_eq!(fx.flusher.stop(&pool).unwrap(), 0);
}
