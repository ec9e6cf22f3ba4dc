//! File-backed KvStore
//!
//! One append-only file per vbucket, named `{vbid}.kv.{revision}`, holding
//! framed document, vbucket-state and header records (see `record`). An
//! in-memory id index and seqno index are rebuilt from the file on open.
//!
//! ## Data Directory Layout
//! ```text
//! data_dir/
//!   ├── 0.kv.1        vbucket 0, revision 1
//!   ├── 4.kv.3        vbucket 4, revision 3 (compacted twice)
//!   └── ...
//! ```
//! A store instance owns the vbuckets of one shard (`vbid % shards`).

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::file_ops::{DefaultFileOps, FileOps, OpsReader};
use super::metadata::MetaData;
use super::record::{self, DocRecord, FrameReader, HeaderRecord, RecordKind};
use super::vbucket_state::{VBStatePersist, VBucketState};
use super::{
    CacheLookup, CacheLookupCallback, CacheLookupKey, CompactionCtx, DbFileInfo, DelCallback,
    DocumentFilter, GetValue, KvStore, RollbackItem, RollbackResult, ScanContext, ScanControl,
    ScanStatus, SetCallback, ValueCallback, ValueFilter, META_STAT_BYTES,
};
use crate::config::Config;
use crate::error::{EpError, Result};
use crate::item::{EngineStatus, Item};
use crate::stats::{Counter, Gauge};

// =============================================================================
// Configuration
// =============================================================================

/// Where a store keeps its files and which vbuckets it owns
#[derive(Debug, Clone)]
pub struct FileKvStoreConfig {
    pub data_dir: PathBuf,
    pub shard_id: u16,
    pub max_vbuckets: u16,
    pub max_shards: u16,
}

impl FileKvStoreConfig {
    pub fn from_config(config: &Config, shard_id: u16) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            shard_id,
            max_vbuckets: config.max_vbuckets,
            max_shards: config.max_num_shards.max(1),
        }
    }

    /// True if `vbid` belongs to this store's shard
    pub fn owns(&self, vbid: u16) -> bool {
        vbid < self.max_vbuckets && vbid % self.max_shards == self.shard_id
    }
}

fn file_name(vbid: u16, revision: u64) -> String {
    format!("{vbid}.kv.{revision}")
}

/// Parse `{vbid}.kv.{revision}`
fn parse_file_name(name: &str) -> Option<(u16, u64)> {
    let mut parts = name.split('.');
    let vbid = parts.next()?.parse().ok()?;
    if parts.next()? != "kv" {
        return None;
    }
    let revision = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((vbid, revision))
}

// =============================================================================
// Per-vbucket file state
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct DocPointer {
    offset: u64,
    len: u64,
    by_seqno: u64,
    deleted: bool,
}

#[derive(Debug, Clone, Copy)]
struct HeaderPointer {
    /// File length including this header
    end: u64,
    high_seqno: u64,
}

struct VBucketFile {
    vbid: u16,
    path: PathBuf,
    file: File,
    revision: u64,
    /// Append position; everything before it is committed
    end: u64,
    by_id: HashMap<Vec<u8>, DocPointer>,
    by_seqno: BTreeMap<u64, Vec<u8>>,
    headers: Vec<HeaderPointer>,
    high_seqno: u64,
    state: Option<VBucketState>,
}

impl VBucketFile {
    fn new(vbid: u16, path: PathBuf, file: File, revision: u64) -> Self {
        Self {
            vbid,
            path,
            file,
            revision,
            end: 0,
            by_id: HashMap::new(),
            by_seqno: BTreeMap::new(),
            headers: Vec::new(),
            high_seqno: 0,
            state: None,
        }
    }

    fn create(ops: &dyn FileOps, dir: &Path, vbid: u16, revision: u64) -> Result<Self> {
        let path = dir.join(file_name(vbid, revision));
        let mut file = ops.open(&path, true)?;
        ops.truncate(&mut file, 0)?;
        debug!(vbid, revision, path = %path.display(), "Created vbucket file");
        Ok(Self::new(vbid, path, file, revision))
    }

    fn load(ops: &dyn FileOps, path: PathBuf, vbid: u16, revision: u64) -> Result<Self> {
        let file = ops.open(&path, false)?;
        let mut vb = Self::new(vbid, path, file, revision);
        vb.replay(ops)?;
        Ok(vb)
    }

    /// Rebuild indices from the file, dropping any uncommitted tail
    fn replay(&mut self, ops: &dyn FileOps) -> Result<()> {
        let len = ops.len(&mut self.file)?;
        let committed = read_committed(ops, &mut self.file, len)?;

        self.by_id.clear();
        self.by_seqno.clear();
        self.high_seqno = 0;
        for (key, ptr) in committed.docs {
            self.index(key, ptr);
        }
        self.high_seqno = self.high_seqno.max(committed.high_seqno);
        self.headers = committed.headers;
        self.state = committed.state;
        self.end = committed.end;

        if self.end < len {
            warn!(
                vbid = self.vbid,
                discarded = len - self.end,
                "Discarding uncommitted data at end of vbucket file"
            );
            ops.truncate(&mut self.file, self.end)?;
        }

        if let Some(state) = self.state.as_mut() {
            if state.repair() {
                warn!(vbid = self.vbid, "Reset invalid max_cas in persisted vbucket state");
            }
        }
        Ok(())
    }

    fn index(&mut self, key: Vec<u8>, ptr: DocPointer) {
        if let Some(old) = self.by_id.get(&key) {
            self.by_seqno.remove(&old.by_seqno);
        }
        self.by_seqno.insert(ptr.by_seqno, key.clone());
        self.high_seqno = self.high_seqno.max(ptr.by_seqno);
        self.by_id.insert(key, ptr);
    }

    fn read_doc(&mut self, ops: &dyn FileOps, ptr: DocPointer) -> Result<DocRecord> {
        let mut buf = vec![0u8; ptr.len as usize];
        ops.read_at(&mut self.file, ptr.offset, &mut buf)?;
        let frame = record::decode_one(&buf)?;
        if frame.kind != RecordKind::Doc {
            return Err(EpError::Corruption(format!(
                "expected document at offset {} of {}",
                ptr.offset,
                self.path.display()
            )));
        }
        record::decode(frame.payload)
    }

    fn doc_count(&self) -> u64 {
        self.by_id.values().filter(|p| !p.deleted).count() as u64
    }

    fn deleted_count(&self) -> u64 {
        self.by_id.values().filter(|p| p.deleted).count() as u64
    }

    fn header_frame(&self, high_seqno: u64, doc_count: u64) -> Result<Vec<u8>> {
        record::encode(
            RecordKind::Header,
            &HeaderRecord {
                high_seqno,
                doc_count,
            },
        )
    }
}

/// Committed contents of a vbucket file, in file order
#[derive(Default)]
struct Committed {
    docs: Vec<(Vec<u8>, DocPointer)>,
    headers: Vec<HeaderPointer>,
    state: Option<VBucketState>,
    end: u64,
    high_seqno: u64,
}

/// Stream the frames of a vbucket file, keeping what a header commits
fn read_committed(ops: &dyn FileOps, file: &mut File, len: u64) -> Result<Committed> {
    let mut frames = FrameReader::new(BufReader::new(OpsReader::new(ops, file, len)), len);
    let mut committed = Committed::default();
    let mut staged_docs: Vec<(Vec<u8>, DocPointer)> = Vec::new();
    let mut staged_state: Option<VBucketState> = None;

    while let Some(frame) = frames.next_frame()? {
        match frame.kind {
            RecordKind::Doc => {
                let doc: DocRecord = record::decode(&frame.payload)?;
                staged_docs.push((
                    doc.key,
                    DocPointer {
                        offset: frame.offset,
                        len: frame.len,
                        by_seqno: doc.by_seqno,
                        deleted: doc.deleted,
                    },
                ));
            }
            RecordKind::VbState => {
                staged_state = Some(record::decode(&frame.payload)?);
            }
            RecordKind::Header => {
                let header: HeaderRecord = record::decode(&frame.payload)?;
                for (_, ptr) in &staged_docs {
                    committed.high_seqno = committed.high_seqno.max(ptr.by_seqno);
                }
                committed.docs.append(&mut staged_docs);
                if let Some(state) = staged_state.take() {
                    committed.state = Some(state);
                }
                committed.high_seqno = committed.high_seqno.max(header.high_seqno);
                committed.end = frame.offset + frame.len;
                committed.headers.push(HeaderPointer {
                    end: committed.end,
                    high_seqno: committed.high_seqno,
                });
            }
        }
    }
    Ok(committed)
}

/// Build an item from a stored document
fn doc_to_item(vbid: u16, doc: DocRecord, value_filter: ValueFilter) -> Result<Item> {
    let meta = MetaData::from_bytes(&doc.meta)?;
    let value = match value_filter {
        ValueFilter::Values => doc.body.map(Bytes::from),
        ValueFilter::KeysOnly => None,
    };
    Ok(Item {
        key: doc.key,
        value,
        flags: meta.flags(),
        expiry: meta.expiry(),
        cas: meta.cas(),
        datatype: meta.datatype(),
        by_seqno: doc.by_seqno,
        rev_seqno: doc.rev_seqno,
        vbid,
        deleted: doc.deleted,
    })
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct KvStoreStats {
    num_read: Counter,
    num_write: Counter,
    read_bytes: Counter,
    write_bytes: Counter,
    total_read_bytes: Counter,
    total_write_bytes: Counter,
    compaction_read_bytes: Counter,
    compaction_write_bytes: Counter,
    failure_set: Counter,
    failure_del: Counter,
    failure_get: Counter,
    failure_compaction: Counter,
    failure_vbstate: Counter,
    num_loaded_vb: Gauge,
}

// =============================================================================
// FileKvStore
// =============================================================================

struct PendingOp {
    vbid: u16,
    doc: DocRecord,
    value_len: u64,
    cb: Box<dyn FnOnce(bool) + Send>,
}

struct Inner {
    vbuckets: HashMap<u16, VBucketFile>,
    /// Last revision used per vbucket; outlives deleted files
    revisions: HashMap<u16, u64>,
    cached_states: HashMap<u16, VBucketState>,
    in_txn: bool,
    pending: Vec<PendingOp>,
}

impl Inner {
    fn vbucket_for_write(
        &mut self,
        ops: &dyn FileOps,
        dir: &Path,
        vbid: u16,
    ) -> Result<&mut VBucketFile> {
        if !self.vbuckets.contains_key(&vbid) {
            let revision = self.revisions.get(&vbid).copied().unwrap_or(0) + 1;
            let vb = VBucketFile::create(ops, dir, vbid, revision)?;
            self.revisions.insert(vbid, revision);
            self.vbuckets.insert(vbid, vb);
        }
        self.vbuckets.get_mut(&vbid).ok_or(EpError::NoSuchFile(vbid))
    }
}

/// KvStore backed by one append-only file per vbucket
pub struct FileKvStore {
    config: FileKvStoreConfig,
    ops: Arc<dyn FileOps>,
    inner: Mutex<Inner>,
    stats: KvStoreStats,
}

impl FileKvStore {
    /// Open the store with plain file access
    pub fn open(config: FileKvStoreConfig) -> Result<Self> {
        Self::with_file_ops(config, Arc::new(DefaultFileOps))
    }

    /// Open the store, loading every vbucket file this shard owns
    ///
    /// Older revisions of a vbucket left behind by an interrupted
    /// compaction are removed.
    pub fn with_file_ops(config: FileKvStoreConfig, ops: Arc<dyn FileOps>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut newest: HashMap<u16, u64> = HashMap::new();
        let mut stale: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((vbid, revision)) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if !config.owns(vbid) {
                continue;
            }
            match newest.get(&vbid).copied() {
                Some(current) if current >= revision => {
                    stale.push(config.data_dir.join(file_name(vbid, revision)))
                }
                Some(current) => {
                    stale.push(config.data_dir.join(file_name(vbid, current)));
                    newest.insert(vbid, revision);
                }
                None => {
                    newest.insert(vbid, revision);
                }
            }
        }

        for path in stale {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove stale vbucket file");
            }
        }

        let mut vbuckets = HashMap::new();
        for (&vbid, &revision) in &newest {
            let path = config.data_dir.join(file_name(vbid, revision));
            vbuckets.insert(vbid, VBucketFile::load(&*ops, path, vbid, revision)?);
        }

        let stats = KvStoreStats::default();
        stats.num_loaded_vb.set(vbuckets.len() as u64);
        info!(
            shard = config.shard_id,
            vbuckets = vbuckets.len(),
            dir = %config.data_dir.display(),
            "Opened file store"
        );

        Ok(Self {
            config,
            ops,
            inner: Mutex::new(Inner {
                vbuckets,
                revisions: newest,
                cached_states: HashMap::new(),
                in_txn: false,
                pending: Vec::new(),
            }),
            stats,
        })
    }

    pub fn config(&self) -> &FileKvStoreConfig {
        &self.config
    }

    /// Path of the vbucket's current file
    pub fn file_path(&self, vbid: u16) -> Option<PathBuf> {
        self.inner.lock().vbuckets.get(&vbid).map(|vb| vb.path.clone())
    }

    /// Current file revision of a vbucket
    pub fn revision(&self, vbid: u16) -> Option<u64> {
        self.inner.lock().vbuckets.get(&vbid).map(|vb| vb.revision)
    }

    /// Highest committed seqno of a vbucket
    pub fn high_seqno(&self, vbid: u16) -> u64 {
        self.inner
            .lock()
            .vbuckets
            .get(&vbid)
            .map_or(0, |vb| vb.high_seqno)
    }

    /// Queue a document write with caller-supplied metadata bytes
    ///
    /// Used to write records in older metadata layouts.
    pub fn set_with_raw_meta(&self, item: &Item, meta: Vec<u8>, cb: SetCallback) {
        let doc = DocRecord {
            key: item.key.clone(),
            meta,
            body: item.value.as_ref().map(|v| v.to_vec()),
            by_seqno: item.by_seqno,
            rev_seqno: item.rev_seqno,
            deleted: item.deleted,
        };
        self.queue(item.vbid, doc, item.value_len() as u64, cb);
    }

    /// Metadata of the stored version of `key`, as found on disk
    pub fn doc_meta(&self, vbid: u16, key: &[u8]) -> Result<Option<MetaData>> {
        let mut inner = self.inner.lock();
        let Some(vb) = inner.vbuckets.get_mut(&vbid) else {
            return Ok(None);
        };
        let Some(ptr) = vb.by_id.get(key).copied() else {
            return Ok(None);
        };
        let doc = vb.read_doc(&*self.ops, ptr)?;
        MetaData::from_bytes(&doc.meta).map(Some)
    }

    fn queue(&self, vbid: u16, doc: DocRecord, value_len: u64, cb: Box<dyn FnOnce(bool) + Send>) {
        let mut inner = self.inner.lock();
        if !inner.in_txn || !self.config.owns(vbid) {
            drop(inner);
            warn!(
                vbid,
                shard = self.config.shard_id,
                "Write rejected: no open transaction or vbucket not in this shard"
            );
            cb(false);
            return;
        }
        inner.pending.push(PendingOp {
            vbid,
            doc,
            value_len,
            cb,
        });
    }

    /// Append one vbucket's share of a commit and sync it
    fn write_batch(&self, inner: &mut Inner, vbid: u16, batch: &mut [PendingOp]) -> Result<()> {
        let vb = inner.vbucket_for_write(&*self.ops, &self.config.data_dir, vbid)?;
        let start = vb.end;
        let mut high_seqno = vb.high_seqno;

        let mut buf = Vec::new();
        let mut pointers = Vec::with_capacity(batch.len());
        for op in batch.iter_mut() {
            if op.doc.by_seqno == 0 {
                high_seqno += 1;
                op.doc.by_seqno = high_seqno;
            } else {
                high_seqno = high_seqno.max(op.doc.by_seqno);
            }
            let frame = record::encode(RecordKind::Doc, &op.doc)?;
            pointers.push((
                op.doc.key.clone(),
                DocPointer {
                    offset: start + buf.len() as u64,
                    len: frame.len() as u64,
                    by_seqno: op.doc.by_seqno,
                    deleted: op.doc.deleted,
                },
            ));
            buf.extend_from_slice(&frame);
        }

        let live_after = {
            let mut live = vb.doc_count() as i64;
            for (key, ptr) in &pointers {
                let was_live = vb.by_id.get(key).is_some_and(|p| !p.deleted);
                live += i64::from(!ptr.deleted) - i64::from(was_live);
            }
            live.max(0) as u64
        };
        buf.extend_from_slice(&vb.header_frame(high_seqno, live_after)?);

        let written = self
            .ops
            .write_at(&mut vb.file, start, &buf)
            .and_then(|_| self.ops.sync(&mut vb.file));
        if let Err(e) = written {
            if let Err(te) = self.ops.truncate(&mut vb.file, start) {
                debug!(vbid, error = %te, "Could not trim failed commit");
            }
            return Err(e.into());
        }

        vb.end = start + buf.len() as u64;
        for (key, ptr) in pointers {
            vb.index(key, ptr);
        }
        vb.high_seqno = high_seqno;
        vb.headers.push(HeaderPointer {
            end: vb.end,
            high_seqno,
        });

        self.stats.num_write.add(batch.len() as u64);
        for op in batch.iter() {
            self.stats
                .write_bytes
                .add(op.doc.key.len() as u64 + op.value_len + META_STAT_BYTES);
        }
        self.stats.total_write_bytes.add(buf.len() as u64);
        Ok(())
    }

    /// Look up one key with the store lock held
    fn get_locked(&self, inner: &mut Inner, key: &[u8], vbid: u16) -> GetValue {
        let Some(vb) = inner.vbuckets.get_mut(&vbid) else {
            return GetValue::not_found();
        };
        let Some(ptr) = vb.by_id.get(key).copied() else {
            return GetValue::not_found();
        };

        let item = vb
            .read_doc(&*self.ops, ptr)
            .and_then(|doc| doc_to_item(vbid, doc, ValueFilter::Values));
        match item {
            Ok(item) => {
                self.stats.num_read.increment();
                self.stats
                    .read_bytes
                    .add(item.key.len() as u64 + item.value_len() as u64);
                self.stats.total_read_bytes.add(ptr.len);
                if item.deleted {
                    // Tombstone: absent, but its metadata is still useful
                    GetValue {
                        status: EngineStatus::KeyNotFound,
                        item: Some(item),
                    }
                } else {
                    GetValue::found(item)
                }
            }
            Err(e) => {
                self.stats.failure_get.increment();
                warn!(
                    vbid,
                    shard = self.config.shard_id,
                    error = %e,
                    "Failed to read document"
                );
                GetValue::temp_fail()
            }
        }
    }

    fn compact_locked(&self, inner: &mut Inner, vbid: u16, ctx: &mut CompactionCtx) -> Result<()> {
        let Inner {
            vbuckets,
            revisions,
            cached_states,
            ..
        } = inner;
        let vb = vbuckets.get_mut(&vbid).ok_or(EpError::NoSuchFile(vbid))?;

        let new_revision = revisions.get(&vbid).copied().unwrap_or(vb.revision).max(vb.revision) + 1;
        let new_path = self.config.data_dir.join(file_name(vbid, new_revision));

        let mut buf = Vec::new();
        let mut compacted = VBucketFile::new(
            vbid,
            new_path.clone(),
            self.ops.open(&new_path, true)?,
            new_revision,
        );
        self.ops.truncate(&mut compacted.file, 0)?;

        let seqnos: Vec<(u64, Vec<u8>)> = vb
            .by_seqno
            .iter()
            .map(|(seqno, key)| (*seqno, key.clone()))
            .collect();
        let mut pointers = Vec::with_capacity(seqnos.len());

        for (seqno, key) in seqnos {
            let Some(ptr) = vb.by_id.get(&key).copied() else {
                continue;
            };
            let mut doc = vb.read_doc(&*self.ops, ptr)?;
            self.stats.compaction_read_bytes.add(ptr.len);

            let meta = MetaData::from_bytes(&doc.meta).ok();
            if doc.deleted {
                let deleted_at = meta.map_or(0, |m| m.expiry());
                let old_enough = deleted_at < ctx.purge_before_ts
                    && (ctx.purge_before_seq == 0 || seqno <= ctx.purge_before_seq);
                if ctx.drop_deletes || old_enough {
                    ctx.max_purged_seq = ctx.max_purged_seq.max(seqno);
                    continue;
                }
            }

            if let Some(meta) = meta {
                let expiry = meta.expiry();
                if !doc.deleted && expiry != 0 && expiry < ctx.curr_time {
                    ctx.expired_items
                        .push(doc_to_item(vbid, doc.clone(), ValueFilter::Values)?);
                }
                // Widen to the current layout; a fixed-size rewrite per record
                doc.meta = meta.to_bytes();
            }

            let frame = record::encode(RecordKind::Doc, &doc)?;
            pointers.push((
                doc.key,
                DocPointer {
                    offset: buf.len() as u64,
                    len: frame.len() as u64,
                    by_seqno: seqno,
                    deleted: doc.deleted,
                },
            ));
            buf.extend_from_slice(&frame);
        }

        let mut state = cached_states.get(&vbid).cloned().or_else(|| vb.state.clone());
        if let Some(state) = state.as_mut() {
            state.purge_seqno = state.purge_seqno.max(ctx.max_purged_seq);
            buf.extend_from_slice(&record::encode(RecordKind::VbState, state)?);
        }
        let live = pointers.iter().filter(|(_, p)| !p.deleted).count() as u64;
        buf.extend_from_slice(&compacted.header_frame(vb.high_seqno, live)?);

        let written = self
            .ops
            .write_at(&mut compacted.file, 0, &buf)
            .and_then(|_| self.ops.sync(&mut compacted.file));
        if let Err(e) = written {
            drop(compacted);
            if let Err(re) = std::fs::remove_file(&new_path) {
                debug!(path = %new_path.display(), error = %re, "Could not remove partial compaction output");
            }
            return Err(e.into());
        }

        for (key, ptr) in pointers {
            compacted.index(key, ptr);
        }
        compacted.high_seqno = vb.high_seqno;
        compacted.end = buf.len() as u64;
        compacted.headers.push(HeaderPointer {
            end: compacted.end,
            high_seqno: compacted.high_seqno,
        });
        compacted.state = state;
        self.stats.compaction_write_bytes.add(buf.len() as u64);

        let old_path = std::mem::replace(vb, compacted).path;
        revisions.insert(vbid, new_revision);
        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "Failed to unlink pre-compaction file");
        }
        Ok(())
    }

    fn write_state(
        &self,
        inner: &mut Inner,
        vbid: u16,
        state: &VBucketState,
        commit: bool,
    ) -> Result<()> {
        let vb = inner.vbucket_for_write(&*self.ops, &self.config.data_dir, vbid)?;
        let start = vb.end;
        let mut buf = record::encode(RecordKind::VbState, state)?;
        if commit {
            buf.extend_from_slice(&vb.header_frame(vb.high_seqno, vb.doc_count())?);
        }

        let mut written = self.ops.write_at(&mut vb.file, start, &buf);
        if commit {
            written = written.and_then(|_| self.ops.sync(&mut vb.file));
        }
        if let Err(e) = written {
            if let Err(te) = self.ops.truncate(&mut vb.file, start) {
                debug!(vbid, error = %te, "Could not trim failed state write");
            }
            return Err(e.into());
        }

        vb.end = start + buf.len() as u64;
        vb.state = Some(state.clone());
        if commit {
            vb.headers.push(HeaderPointer {
                end: vb.end,
                high_seqno: vb.high_seqno,
            });
        }
        self.stats.total_write_bytes.add(buf.len() as u64);
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn shard_id(&self) -> u16 {
        self.config.shard_id
    }

    fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_txn {
            return false;
        }
        inner.in_txn = true;
        true
    }

    fn commit(&self) -> bool {
        let (callbacks, success) = {
            let mut inner = self.inner.lock();
            if !inner.in_txn {
                return false;
            }
            inner.in_txn = false;
            let pending = std::mem::take(&mut inner.pending);
            if pending.is_empty() {
                return true;
            }

            let mut by_vbucket: BTreeMap<u16, Vec<PendingOp>> = BTreeMap::new();
            for op in pending {
                by_vbucket.entry(op.vbid).or_default().push(op);
            }

            let mut callbacks = Vec::new();
            let mut success = true;
            for (vbid, mut batch) in by_vbucket {
                let ok = match self.write_batch(&mut inner, vbid, &mut batch) {
                    Ok(()) => true,
                    Err(e) => {
                        let dels = batch.iter().filter(|op| op.doc.deleted).count() as u64;
                        self.stats.failure_del.add(dels);
                        self.stats.failure_set.add(batch.len() as u64 - dels);
                        warn!(
                            vbid,
                            shard = self.config.shard_id,
                            items = batch.len(),
                            error = %e,
                            "Commit failed"
                        );
                        false
                    }
                };
                success &= ok;
                callbacks.extend(batch.into_iter().map(|op| (op.cb, ok)));
            }
            (callbacks, success)
        };

        for (cb, ok) in callbacks {
            cb(ok);
        }
        success
    }

    fn rollback_txn(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.in_txn = false;
            std::mem::take(&mut inner.pending)
        };
        for op in pending {
            (op.cb)(false);
        }
    }

    fn set(&self, item: &Item, cb: SetCallback) {
        let doc = DocRecord {
            key: item.key.clone(),
            meta: MetaData::from_item(item).to_bytes(),
            body: item.value.as_ref().map(|v| v.to_vec()),
            by_seqno: item.by_seqno,
            rev_seqno: item.rev_seqno,
            deleted: false,
        };
        self.queue(item.vbid, doc, item.value_len() as u64, cb);
    }

    fn del(&self, item: &Item, cb: DelCallback) {
        let doc = DocRecord {
            key: item.key.clone(),
            meta: MetaData::from_item(item).to_bytes(),
            body: None,
            by_seqno: item.by_seqno,
            rev_seqno: item.rev_seqno,
            deleted: true,
        };
        self.queue(item.vbid, doc, 0, cb);
    }

    fn get(&self, key: &[u8], vbid: u16) -> GetValue {
        let mut inner = self.inner.lock();
        self.get_locked(&mut inner, key, vbid)
    }

    fn get_multi(&self, vbid: u16, keys: &[Vec<u8>]) -> Vec<GetValue> {
        let mut inner = self.inner.lock();
        keys.iter()
            .map(|key| self.get_locked(&mut inner, key, vbid))
            .collect()
    }

    fn init_scan_context(
        &self,
        value_cb: ValueCallback,
        lookup_cb: CacheLookupCallback,
        vbid: u16,
        start_seqno: u64,
        document_filter: DocumentFilter,
        value_filter: ValueFilter,
    ) -> Option<ScanContext> {
        let inner = self.inner.lock();
        let vb = inner.vbuckets.get(&vbid)?;
        Some(ScanContext {
            vbid,
            start_seqno,
            max_seqno: vb.high_seqno,
            last_read_seqno: start_seqno.saturating_sub(1),
            document_filter,
            value_filter,
            document_count: vb.doc_count(),
            value_cb,
            lookup_cb,
        })
    }

    fn scan(&self, ctx: &mut ScanContext) -> ScanStatus {
        loop {
            let next = {
                let inner = self.inner.lock();
                let Some(vb) = inner.vbuckets.get(&ctx.vbid) else {
                    return ScanStatus::Failed;
                };
                vb.by_seqno
                    .range(ctx.last_read_seqno.saturating_add(1)..=ctx.max_seqno)
                    .next()
                    .and_then(|(seqno, key)| {
                        vb.by_id.get(key).map(|ptr| (*seqno, key.clone(), *ptr))
                    })
            };
            let Some((seqno, key, ptr)) = next else {
                return ScanStatus::Success;
            };

            if ptr.deleted && ctx.document_filter == DocumentFilter::NoDeletes {
                ctx.last_read_seqno = seqno;
                continue;
            }

            let lookup = CacheLookupKey {
                vbid: ctx.vbid,
                key,
                by_seqno: seqno,
            };
            match (ctx.lookup_cb)(&lookup) {
                CacheLookup::Skip => {
                    ctx.last_read_seqno = seqno;
                    continue;
                }
                CacheLookup::Pause => return ScanStatus::Again,
                CacheLookup::Fetch => {}
            }

            let item = {
                let mut inner = self.inner.lock();
                let Some(vb) = inner.vbuckets.get_mut(&ctx.vbid) else {
                    return ScanStatus::Failed;
                };
                vb.read_doc(&*self.ops, ptr)
                    .and_then(|doc| doc_to_item(ctx.vbid, doc, ctx.value_filter))
            };
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    self.stats.failure_get.increment();
                    warn!(vbid = ctx.vbid, seqno, error = %e, "Scan failed to read document");
                    return ScanStatus::Failed;
                }
            };
            self.stats.num_read.increment();
            self.stats.total_read_bytes.add(ptr.len);

            match (ctx.value_cb)(GetValue::found(item)) {
                ScanControl::Continue => ctx.last_read_seqno = seqno,
                ScanControl::Pause => return ScanStatus::Again,
            }
        }
    }

    fn destroy_scan_context(&self, ctx: ScanContext) {
        debug!(
            vbid = ctx.vbid,
            last_read_seqno = ctx.last_read_seqno,
            "Scan finished"
        );
    }

    fn compact_db(&self, vbid: u16, ctx: &mut CompactionCtx) -> bool {
        let mut inner = self.inner.lock();
        match self.compact_locked(&mut inner, vbid, ctx) {
            Ok(()) => {
                debug!(
                    vbid,
                    max_purged_seq = ctx.max_purged_seq,
                    expired = ctx.expired_items.len(),
                    "Compaction complete"
                );
                true
            }
            Err(e) => {
                self.stats.failure_compaction.increment();
                warn!(vbid, shard = self.config.shard_id, error = %e, "Compaction failed");
                false
            }
        }
    }

    fn rollback(
        &self,
        vbid: u16,
        rollback_seqno: u64,
        cb: &mut dyn FnMut(RollbackItem),
    ) -> RollbackResult {
        let (changed, high_seqno) = {
            let mut inner = self.inner.lock();
            let Some(vb) = inner.vbuckets.get_mut(&vbid) else {
                return RollbackResult::failed();
            };
            let Some(header) = vb
                .headers
                .iter()
                .rev()
                .find(|h| h.high_seqno <= rollback_seqno)
                .copied()
            else {
                info!(vbid, rollback_seqno, "No commit point to roll back to");
                return RollbackResult::failed();
            };
            if header.end == vb.end {
                return RollbackResult {
                    success: true,
                    high_seqno: vb.high_seqno,
                };
            }

            let keys: Vec<Vec<u8>> = vb
                .by_seqno
                .range(header.high_seqno.saturating_add(1)..)
                .map(|(_, key)| key.clone())
                .collect();

            let rewound = self
                .ops
                .truncate(&mut vb.file, header.end)
                .and_then(|_| self.ops.sync(&mut vb.file))
                .map_err(EpError::from)
                .and_then(|_| vb.replay(&*self.ops));
            if let Err(e) = rewound {
                warn!(vbid, error = %e, "Rollback failed; vbucket must be rebuilt");
                inner.vbuckets.remove(&vbid);
                return RollbackResult::failed();
            }

            let mut changed = Vec::with_capacity(keys.len());
            for key in keys {
                let item = match vb.by_id.get(&key).copied() {
                    Some(ptr) if !ptr.deleted => match vb
                        .read_doc(&*self.ops, ptr)
                        .and_then(|doc| doc_to_item(vbid, doc, ValueFilter::Values))
                    {
                        Ok(item) => Some(item),
                        Err(e) => {
                            warn!(vbid, error = %e, "Rollback could not read restored document");
                            return RollbackResult::failed();
                        }
                    },
                    _ => None,
                };
                changed.push(RollbackItem { key, item });
            }
            (changed, vb.high_seqno)
        };

        for item in changed {
            cb(item);
        }
        info!(vbid, rollback_seqno, high_seqno, "Rolled back vbucket");
        RollbackResult {
            success: true,
            high_seqno,
        }
    }

    fn snapshot_vbucket(&self, vbid: u16, state: &VBucketState, mode: VBStatePersist) -> bool {
        let mut inner = self.inner.lock();
        inner.cached_states.insert(vbid, state.clone());

        let commit = match mode {
            VBStatePersist::CacheUpdateOnly => return true,
            VBStatePersist::PersistWithoutCommit => false,
            VBStatePersist::PersistWithCommit => true,
        };
        match self.write_state(&mut inner, vbid, state, commit) {
            Ok(()) => true,
            Err(e) => {
                self.stats.failure_vbstate.increment();
                warn!(vbid, shard = self.config.shard_id, error = %e, "Failed to persist vbucket state");
                false
            }
        }
    }

    fn list_persisted_vbuckets(&self) -> Vec<Option<VBucketState>> {
        let inner = self.inner.lock();
        let mut states = vec![None; self.config.max_vbuckets as usize];
        for (vbid, vb) in &inner.vbuckets {
            if let Some(slot) = states.get_mut(*vbid as usize) {
                *slot = vb.state.clone();
            }
        }
        states
    }

    fn del_vbucket(&self, vbid: u16) -> bool {
        let mut inner = self.inner.lock();
        inner.cached_states.remove(&vbid);
        let Some(vb) = inner.vbuckets.remove(&vbid) else {
            return false;
        };
        let path = vb.path.clone();
        drop(vb);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(vbid, path = %path.display(), "Deleted vbucket file");
                true
            }
            Err(e) => {
                warn!(vbid, path = %path.display(), error = %e, "Failed to delete vbucket file");
                false
            }
        }
    }

    fn increment_revision(&self, vbid: u16) {
        let mut inner = self.inner.lock();
        let current = inner
            .vbuckets
            .get(&vbid)
            .map_or(0, |vb| vb.revision)
            .max(inner.revisions.get(&vbid).copied().unwrap_or(0));
        inner.revisions.insert(vbid, current + 1);
    }

    fn db_file_info(&self, vbid: u16) -> Result<DbFileInfo> {
        let inner = self.inner.lock();
        let vb = inner.vbuckets.get(&vbid).ok_or(EpError::NoSuchFile(vbid))?;
        Ok(DbFileInfo {
            file_size: vb.end,
            space_used: vb.by_id.values().map(|p| p.len).sum(),
            doc_count: vb.doc_count(),
            deleted_count: vb.deleted_count(),
            revision: vb.revision,
        })
    }

    fn add_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let prefix = format!("rw_{}:", self.config.shard_id);
        let s = &self.stats;
        let counters = [
            ("io_num_read", s.num_read.value()),
            ("io_num_write", s.num_write.value()),
            ("io_read_bytes", s.read_bytes.value()),
            ("io_write_bytes", s.write_bytes.value()),
            ("io_total_read_bytes", s.total_read_bytes.value()),
            ("io_total_write_bytes", s.total_write_bytes.value()),
            ("io_compaction_read_bytes", s.compaction_read_bytes.value()),
            ("io_compaction_write_bytes", s.compaction_write_bytes.value()),
            ("failure_set", s.failure_set.value()),
            ("failure_del", s.failure_del.value()),
            ("failure_get", s.failure_get.value()),
            ("failure_compaction", s.failure_compaction.value()),
            ("failure_vbstate", s.failure_vbstate.value()),
            ("numLoadedVb", s.num_loaded_vb.value()),
        ];
        for (name, value) in counters {
            add_stat(&format!("{prefix}{name}"), &value.to_string());
        }
    }
}
