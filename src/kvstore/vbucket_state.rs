//! Persisted per-vbucket state

use serde::{Deserialize, Serialize};

/// Role of a vbucket on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VBucketStateKind {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VBucketStateKind::Active => "active",
            VBucketStateKind::Replica => "replica",
            VBucketStateKind::Pending => "pending",
            VBucketStateKind::Dead => "dead",
        }
    }
}

impl std::fmt::Display for VBucketStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One branch point in a vbucket's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub vb_uuid: u64,
    pub by_seqno: u64,
}

/// Metadata recorded independently of document mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketState {
    pub state: VBucketStateKind,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub max_cas: u64,
    /// Newest entry first
    pub failover_log: Vec<FailoverEntry>,
}

impl VBucketState {
    pub fn new(state: VBucketStateKind) -> Self {
        Self {
            state,
            checkpoint_id: 0,
            max_deleted_seqno: 0,
            high_seqno: 0,
            purge_seqno: 0,
            max_cas: 0,
            failover_log: Vec::new(),
        }
    }

    /// Canonicalise values that cannot be valid
    ///
    /// An all-ones CAS was written by a bug in earlier releases; it would
    /// make every future CAS comparison fail, so it is reset.
    pub fn repair(&mut self) -> bool {
        if self.max_cas == u64::MAX {
            self.max_cas = 0;
            return true;
        }
        false
    }
}

/// How far a state snapshot should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBStatePersist {
    /// Update the store's cached copy only
    CacheUpdateOnly,

    /// Write the state record without a commit point
    PersistWithoutCommit,

    /// Write the state record and commit
    PersistWithCommit,
}
