//! KVStore Module
//!
//! The contract between the engine and a durable backing store, plus a
//! file-backed implementation.
//!
//! ## Responsibilities
//! - Transactional batches of sets and deletes (`begin` .. `commit`)
//! - Point and batched lookups that tell "not found" from "try again"
//! - Sequence-ordered scans for warmup and backfill
//! - Compaction, rollback and per-vbucket state snapshots
//! - Versioned record metadata, upgraded lazily and rewritten by compaction
//!
//! ## Write Flow
//! ```text
//!   flusher ──begin()──► KvStore ──set()/del()──► pending ops
//!                                                     │
//!                         commit() ── write + sync ◄──┘
//!                             │
//!                             ▼   (store lock released)
//!                   persistence callbacks(success | failure)
//! ```

mod file_ops;
mod file_store;
mod metadata;
mod record;
mod vbucket_state;

pub use file_ops::{DefaultFileOps, FileOps};
pub use file_store::{FileKvStore, FileKvStoreConfig};
pub use metadata::{
    MetaData, MetaDataV0, MetaDataV1, MetaDataV2, MetaDataVersion, FLEX_META_CODE,
};
pub use vbucket_state::{FailoverEntry, VBStatePersist, VBucketState, VBucketStateKind};

use crate::error::Result;
use crate::item::{EngineStatus, Item};

/// Bytes of metadata charged per document in write statistics
pub const META_STAT_BYTES: u64 = MetaDataVersion::V1.size() as u64;

/// Called once a queued set has been committed (true) or failed (false)
pub type SetCallback = Box<dyn FnOnce(bool) + Send>;

/// Called once a queued delete has been committed (true) or failed (false)
pub type DelCallback = Box<dyn FnOnce(bool) + Send>;

/// Result of a point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetValue {
    /// `Success`, `KeyNotFound` or `TempFail`
    pub status: EngineStatus,
    pub item: Option<Item>,
}

impl GetValue {
    pub fn found(item: Item) -> Self {
        Self {
            status: EngineStatus::Success,
            item: Some(item),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: EngineStatus::KeyNotFound,
            item: None,
        }
    }

    pub fn temp_fail() -> Self {
        Self {
            status: EngineStatus::TempFail,
            item: None,
        }
    }
}

// =============================================================================
// Scans
// =============================================================================

/// Which documents a scan returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFilter {
    AllItems,
    NoDeletes,
}

/// Whether a scan reads document bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFilter {
    KeysOnly,
    Values,
}

/// Answer from the cache lookup callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Not in memory: read the document and hand it to the value callback
    Fetch,

    /// Already resident: skip it
    Skip,

    /// Stop for now; the same document is offered again on the next scan
    Pause,
}

/// Answer from the value callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Document accepted
    Continue,

    /// Document not accepted; offer it again on the next scan
    Pause,
}

/// Outcome of one `scan` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Range exhausted
    Success,

    /// A callback paused; call `scan` again to continue
    Again,

    /// The store could not read a document
    Failed,
}

/// What the cache lookup callback is shown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookupKey {
    pub vbid: u16,
    pub key: Vec<u8>,
    pub by_seqno: u64,
}

pub type ValueCallback = Box<dyn FnMut(GetValue) -> ScanControl + Send>;
pub type CacheLookupCallback = Box<dyn FnMut(&CacheLookupKey) -> CacheLookup + Send>;

/// Cursor over one vbucket's documents in seqno order
pub struct ScanContext {
    pub vbid: u16,
    pub start_seqno: u64,
    /// High seqno when the scan was created
    pub max_seqno: u64,
    /// Last seqno fully handled
    pub last_read_seqno: u64,
    pub document_filter: DocumentFilter,
    pub value_filter: ValueFilter,
    pub document_count: u64,
    pub(crate) value_cb: ValueCallback,
    pub(crate) lookup_cb: CacheLookupCallback,
}

// =============================================================================
// Compaction / rollback / file info
// =============================================================================

/// Parameters and results of a compaction run
#[derive(Debug, Clone, Default)]
pub struct CompactionCtx {
    /// Tombstones deleted before this time are purged
    pub purge_before_ts: u32,

    /// Only tombstones at or below this seqno are purged (0 = any)
    pub purge_before_seq: u64,

    /// Purge every tombstone regardless of age
    pub drop_deletes: bool,

    /// Time used to decide which documents have expired
    pub curr_time: u32,

    /// Highest seqno of a purged tombstone
    pub max_purged_seq: u64,

    /// Live documents found expired; the caller deletes them
    pub expired_items: Vec<Item>,
}

/// A key whose state changed because of a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackItem {
    pub key: Vec<u8>,
    /// State at the rollback point; `None` if the key did not exist then
    pub item: Option<Item>,
}

/// Outcome of a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackResult {
    /// False means the vbucket must be rebuilt from scratch
    pub success: bool,
    pub high_seqno: u64,
}

impl RollbackResult {
    pub fn failed() -> Self {
        Self {
            success: false,
            high_seqno: 0,
        }
    }
}

/// Size information for a vbucket file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbFileInfo {
    pub file_size: u64,
    pub space_used: u64,
    pub doc_count: u64,
    pub deleted_count: u64,
    pub revision: u64,
}

// =============================================================================
// KvStore
// =============================================================================

/// A durable backing store for one shard of vbuckets
///
/// Implementations serialize access internally. Persistence callbacks run
/// after `commit` has released every internal lock.
pub trait KvStore: Send + Sync {
    /// Shard this store serves
    fn shard_id(&self) -> u16;

    /// Start a transaction; false if one is already open
    fn begin(&self) -> bool;

    /// Write every queued operation durably, then fire their callbacks
    fn commit(&self) -> bool;

    /// Drop queued operations; their callbacks report failure
    fn rollback_txn(&self);

    /// Queue a document write
    fn set(&self, item: &Item, cb: SetCallback);

    /// Queue a tombstone write
    fn del(&self, item: &Item, cb: DelCallback);

    fn get(&self, key: &[u8], vbid: u16) -> GetValue;

    /// One result per key, in the same order
    fn get_multi(&self, vbid: u16, keys: &[Vec<u8>]) -> Vec<GetValue>;

    /// Cursor from `start_seqno` to the current high seqno; `None` if the
    /// vbucket has no file
    fn init_scan_context(
        &self,
        value_cb: ValueCallback,
        lookup_cb: CacheLookupCallback,
        vbid: u16,
        start_seqno: u64,
        document_filter: DocumentFilter,
        value_filter: ValueFilter,
    ) -> Option<ScanContext>;

    fn scan(&self, ctx: &mut ScanContext) -> ScanStatus;

    fn destroy_scan_context(&self, ctx: ScanContext);

    /// Rewrite `vbid`'s file without purgeable tombstones
    fn compact_db(&self, vbid: u16, ctx: &mut CompactionCtx) -> bool;

    /// Discard mutations after `rollback_seqno`, reporting each changed key
    fn rollback(
        &self,
        vbid: u16,
        rollback_seqno: u64,
        cb: &mut dyn FnMut(RollbackItem),
    ) -> RollbackResult;

    fn snapshot_vbucket(&self, vbid: u16, state: &VBucketState, mode: VBStatePersist) -> bool;

    /// Indexed by vbid; `Some` for every vbucket this store holds
    fn list_persisted_vbuckets(&self) -> Vec<Option<VBucketState>>;

    /// Remove a vbucket's file; a later write starts a new revision
    fn del_vbucket(&self, vbid: u16) -> bool;

    /// Bump the revision used the next time the vbucket's file is created
    fn increment_revision(&self, vbid: u16);

    fn db_file_info(&self, vbid: u16) -> Result<DbFileInfo>;

    /// Emit `rw_{shard}:` prefixed statistics
    fn add_stats(&self, add_stat: &mut dyn FnMut(&str, &str));
}
