//! Item definitions
//!
//! An [`Item`] is an owned, detached copy of a document. It is what leaves
//! the hash table (reads, flusher copies) and what the backing store reads
//! and writes. Nothing in an `Item` aliases hash table memory.

use bytes::Bytes;

/// Datatype: raw bytes
pub const DATATYPE_RAW_BYTES: u8 = 0x00;

/// Datatype: JSON document
pub const DATATYPE_JSON: u8 = 0x01;

/// A document and its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Document key
    pub key: Vec<u8>,

    /// Document body; `None` for deletions and metadata-only copies
    pub value: Option<Bytes>,

    /// Opaque client flags
    pub flags: u32,

    /// Expiry time (0 = never)
    pub expiry: u32,

    /// Version stamp for optimistic concurrency
    pub cas: u64,

    /// Body datatype
    pub datatype: u8,

    /// Partition sequence number (0 = not yet assigned)
    pub by_seqno: u64,

    /// Revision sequence number (bumped on every mutation of the key)
    pub rev_seqno: u64,

    /// Owning partition
    pub vbid: u16,

    /// Tombstone marker
    pub deleted: bool,
}

impl Item {
    /// Create a live item with the given value
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            flags: 0,
            expiry: 0,
            cas: 0,
            datatype: DATATYPE_RAW_BYTES,
            by_seqno: 0,
            rev_seqno: 1,
            vbid: 0,
            deleted: false,
        }
    }

    /// Create a deletion (tombstone) item for a key
    pub fn deletion(key: impl Into<Vec<u8>>, vbid: u16) -> Self {
        Self {
            key: key.into(),
            value: None,
            flags: 0,
            expiry: 0,
            cas: 0,
            datatype: DATATYPE_RAW_BYTES,
            by_seqno: 0,
            rev_seqno: 1,
            vbid,
            deleted: true,
        }
    }

    pub fn with_vbucket(mut self, vbid: u16) -> Self {
        self.vbid = vbid;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_seqno(mut self, seqno: u64) -> Self {
        self.by_seqno = seqno;
        self
    }

    /// Length of the value in bytes (0 when absent)
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// Status returned to the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Operation completed
    Success,

    /// Key positively confirmed absent
    KeyNotFound,

    /// Key exists (CAS mismatch or add on existing key)
    KeyExists,

    /// Transient failure; retry later
    TempFail,

    /// Result pending a background fetch; caller will be notified
    WouldBlock,

    /// Memory quota exceeded
    NoMemory,

    /// Vbucket not active on this node
    NotMyVbucket,
}
