//! StoredValue implementation
//!
//! The record kept in a hash bucket for one key.

use bytes::Bytes;

use crate::item::Item;
use crate::time::RelTime;

/// NRU value given to newly stored items
pub const INITIAL_NRU_VALUE: u8 = 2;

/// Most recently used
pub const MIN_NRU_VALUE: u8 = 0;

/// Least recently used; first candidate for ejection
pub const MAX_NRU_VALUE: u8 = 3;

/// Fixed per-entry bookkeeping charged on top of key and value bytes
const ENTRY_OVERHEAD: usize = 64;

/// Placeholder states used while the backing store is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempState {
    /// Background fetch in flight
    Initial,

    /// Backing store confirmed the key does not exist
    NonExistent,

    /// Backing store holds a tombstone for the key
    Deleted,
}

/// In-memory record for one key
///
/// Size-affecting fields (value, deleted, temp state) are only changed by
/// the owning [`HashTable`](super::HashTable) so its accounting stays exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    key: Vec<u8>,
    pub(crate) value: Option<Bytes>,
    pub(crate) flags: u32,
    pub(crate) expiry: u32,
    pub(crate) cas: u64,
    pub(crate) datatype: u8,
    pub(crate) by_seqno: u64,
    pub(crate) rev_seqno: u64,
    nru: u8,
    dirty: bool,
    pub(crate) deleted: bool,
    pub(crate) deleted_time: RelTime,
    queued_time: RelTime,
    dirtied_time: RelTime,
    pub(crate) temp: Option<TempState>,
}

impl StoredValue {
    /// Create a dirty value from an item
    pub(crate) fn from_item(item: &Item, cas: u64, now: RelTime) -> Self {
        let mut sv = Self::clean_from_item(item);
        sv.cas = cas;
        sv.mark_dirty(now);
        sv
    }

    /// Create a clean (already persisted) value from an item, keeping its CAS
    pub(crate) fn clean_from_item(item: &Item) -> Self {
        Self {
            key: item.key.clone(),
            value: if item.deleted { None } else { item.value.clone() },
            flags: item.flags,
            expiry: item.expiry,
            cas: item.cas,
            datatype: item.datatype,
            by_seqno: item.by_seqno,
            rev_seqno: item.rev_seqno,
            nru: INITIAL_NRU_VALUE,
            dirty: false,
            deleted: item.deleted,
            deleted_time: if item.deleted { item.expiry } else { 0 },
            queued_time: 0,
            dirtied_time: 0,
            temp: None,
        }
    }

    /// Create a placeholder awaiting a background fetch
    pub(crate) fn temp_initial(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: None,
            flags: 0,
            expiry: 0,
            cas: 0,
            datatype: 0,
            by_seqno: 0,
            rev_seqno: 0,
            nru: MAX_NRU_VALUE,
            dirty: false,
            deleted: false,
            deleted_time: 0,
            queued_time: 0,
            dirtied_time: 0,
            temp: Some(TempState::Initial),
        }
    }

    /// Overwrite value and metadata from an item (CAS assigned by caller)
    pub(crate) fn set_from_item(&mut self, item: &Item, cas: u64, now: RelTime) {
        self.value = item.value.clone();
        self.flags = item.flags;
        self.expiry = item.expiry;
        self.datatype = item.datatype;
        self.cas = cas;
        self.rev_seqno = (self.rev_seqno + 1).max(item.rev_seqno);
        if item.by_seqno != 0 {
            self.by_seqno = item.by_seqno;
        }
        self.deleted = false;
        self.deleted_time = 0;
        self.temp = None;
        self.referenced();
        self.mark_dirty(now);
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    pub fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    pub fn nru_value(&self) -> u8 {
        self.nru
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn deleted_time(&self) -> RelTime {
        self.deleted_time
    }

    /// Value held in memory (not ejected)
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_temp_item(&self) -> bool {
        self.temp.is_some()
    }

    pub fn is_temp_initial(&self) -> bool {
        self.temp == Some(TempState::Initial)
    }

    pub fn is_temp_non_existent(&self) -> bool {
        self.temp == Some(TempState::NonExistent)
    }

    pub fn is_temp_deleted(&self) -> bool {
        self.temp == Some(TempState::Deleted)
    }

    /// Time this value was first dirtied since it was last clean
    pub fn queued_time(&self) -> RelTime {
        self.queued_time
    }

    /// Time the value last changed
    pub fn dirtied_time(&self) -> RelTime {
        self.dirtied_time
    }

    /// Bytes charged to the table for this entry
    pub fn size(&self) -> usize {
        ENTRY_OVERHEAD + self.key.len() + self.value_size()
    }

    /// Bytes of value held in memory
    pub fn value_size(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    // -------------------------------------------------------------------------
    // State transitions that do not affect accounting
    // -------------------------------------------------------------------------

    /// Record a change of value; keeps the original queue time while dirty
    pub fn mark_dirty(&mut self, now: RelTime) {
        if !self.dirty {
            self.queued_time = now;
        }
        self.dirtied_time = now;
        self.dirty = true;
    }

    /// Mark as persisted, returning `(queued_time, dirtied_time)`
    pub fn mark_clean(&mut self) -> (RelTime, RelTime) {
        self.dirty = false;
        (self.queued_time, self.dirtied_time)
    }

    /// Count an access: move one step towards most-recently-used
    pub fn referenced(&mut self) {
        if self.nru > MIN_NRU_VALUE {
            self.nru -= 1;
        }
    }

    /// Age one step towards least-recently-used; true once at the maximum
    pub fn age_nru(&mut self) -> bool {
        if self.nru < MAX_NRU_VALUE {
            self.nru += 1;
        }
        self.nru == MAX_NRU_VALUE
    }

    /// Detached copy for use outside the bucket lock
    ///
    /// A tombstone carries its deletion time in `expiry`, which is how the
    /// backing store records it.
    pub fn to_item(&self, vbid: u16) -> Item {
        Item {
            key: self.key.clone(),
            value: self.value.clone(),
            flags: self.flags,
            expiry: if self.deleted { self.deleted_time } else { self.expiry },
            cas: self.cas,
            datatype: self.datatype,
            by_seqno: self.by_seqno,
            rev_seqno: self.rev_seqno,
            vbid,
            deleted: self.deleted,
        }
    }
}
