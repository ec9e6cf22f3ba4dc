//! # epkv
//!
//! An eventually-persistent key-value engine:
//! - Writes land in a striped in-memory hash table and return at once
//! - Per-shard flushers batch dirty keys into storage transactions
//! - Evicted values are read back by a batching background fetcher
//! - Maintenance (compaction, paging, snapshots) runs on a priority executor
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EpStore                               │
//! │          (vbucket routing, quota, vbucket states)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                VBucket ── HashTable                          │
//! │     (seqnos, failover log, striped bucket locks)             │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ dirty keys                        │ misses
//!            ▼                                   ▼
//!   ┌─────────────────┐                 ┌─────────────────┐
//!   │ DirtyQueue      │                 │   BgFetcher     │
//!   │   ► Flusher     │                 │  (get_multi)    │
//!   └────────┬────────┘                 └────────┬────────┘
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────────────────────────────────────────────┐
//!   │              KvStore (one FileKvStore per shard)         │
//!   └─────────────────────────────────────────────────────────┘
//!
//!   ExecutorPool: flushers, fetchers, compaction, pager, snapshots
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod time;
pub mod item;
pub mod stats;

pub mod hashtable;
pub mod kvstore;
pub mod executor;
pub mod flusher;
pub mod vbucket;
pub mod bgfetcher;
pub mod tasks;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use engine::EpStore;
pub use error::{EpError, Result};
pub use hashtable::{EvictionPolicy, HashTable, MutationStatus};
pub use item::{EngineStatus, Item};
pub use kvstore::{FileKvStore, GetValue, KvStore, VBucketStateKind};
pub use tasks::CompactionConfig;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of epkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
