//! Configuration for epkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::hashtable::EvictionPolicy;

/// Main configuration for an epkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all vbucket files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── 0.kv.1          (vbucket 0, revision 1)
    ///     ├── 1.kv.3          (vbucket 1, revision 3)
    ///     └── ...
    pub data_dir: PathBuf,

    /// Number of partitions (vbuckets) this node can host
    pub max_vbuckets: u16,

    /// Number of storage shards; vbucket `v` belongs to shard `v % shards`.
    /// Tasks touching the same shard's files are serialized.
    pub max_num_shards: u16,

    // -------------------------------------------------------------------------
    // Hash Table Configuration
    // -------------------------------------------------------------------------
    /// Initial number of hash buckets per vbucket
    pub ht_size: usize,

    /// Number of bucket locks per hash table (striped across buckets)
    pub ht_locks: usize,

    /// What eviction removes: just the value, or the whole entry
    pub eviction_policy: EvictionPolicy,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Memory quota (bytes) checked before every mutation
    pub max_size: usize,

    /// Item pager starts ejecting above this mark
    pub mem_high_wat: usize,

    /// Item pager stops ejecting below this mark
    pub mem_low_wat: usize,

    // -------------------------------------------------------------------------
    // Flusher Configuration
    // -------------------------------------------------------------------------
    /// Max items written per begin()/commit() pair
    pub txn_size: usize,

    /// How long an idle flusher blocks waiting for new dirty items
    pub flusher_idle_wait: Duration,

    /// Dirty ages above this are clamped and reported
    pub max_dirty_age: Duration,

    // -------------------------------------------------------------------------
    // Executor Configuration
    // -------------------------------------------------------------------------
    /// Number of worker threads in the executor pool
    pub num_workers: usize,

    /// Delay before a scheduled background fetch runs (batching window)
    pub bg_fetch_delay: Duration,

    /// Interval between item pager runs
    pub pager_sleep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./epkv_data"),
            max_vbuckets: 16,
            max_num_shards: 4,
            ht_size: 47,
            ht_locks: 5,
            eviction_policy: EvictionPolicy::ValueOnly,
            max_size: 256 * 1024 * 1024, // 256 MB
            mem_high_wat: 216 * 1024 * 1024,
            mem_low_wat: 192 * 1024 * 1024,
            txn_size: 250,
            flusher_idle_wait: Duration::from_millis(100),
            max_dirty_age: Duration::from_secs(86400 * 30),
            num_workers: 4,
            bg_fetch_delay: Duration::from_millis(0),
            pager_sleep: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Shard owning the given vbucket
    pub fn shard_of(&self, vbid: u16) -> u16 {
        vbid % self.max_num_shards.max(1)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of vbuckets
    pub fn max_vbuckets(mut self, count: u16) -> Self {
        self.config.max_vbuckets = count;
        self
    }

    /// Set the number of storage shards
    pub fn max_num_shards(mut self, count: u16) -> Self {
        self.config.max_num_shards = count;
        self
    }

    /// Set the initial hash table size (buckets)
    pub fn ht_size(mut self, size: usize) -> Self {
        self.config.ht_size = size;
        self
    }

    /// Set the number of hash table locks
    pub fn ht_locks(mut self, locks: usize) -> Self {
        self.config.ht_locks = locks;
        self
    }

    /// Set the eviction policy
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction_policy = policy;
        self
    }

    /// Set the memory quota (in bytes); watermarks follow at 85% / 75%
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self.config.mem_high_wat = size / 100 * 85;
        self.config.mem_low_wat = size / 100 * 75;
        self
    }

    /// Set the pager watermarks explicitly (in bytes)
    pub fn watermarks(mut self, low: usize, high: usize) -> Self {
        self.config.mem_low_wat = low;
        self.config.mem_high_wat = high;
        self
    }

    /// Set the flusher transaction size (items per commit)
    pub fn txn_size(mut self, size: usize) -> Self {
        self.config.txn_size = size;
        self
    }

    /// Set how long an idle flusher waits for work
    pub fn flusher_idle_wait(mut self, wait: Duration) -> Self {
        self.config.flusher_idle_wait = wait;
        self
    }

    /// Set the dirty age ceiling
    pub fn max_dirty_age(mut self, age: Duration) -> Self {
        self.config.max_dirty_age = age;
        self
    }

    /// Set the number of executor worker threads
    pub fn num_workers(mut self, count: usize) -> Self {
        self.config.num_workers = count;
        self
    }

    /// Set the background fetch batching delay
    pub fn bg_fetch_delay(mut self, delay: Duration) -> Self {
        self.config.bg_fetch_delay = delay;
        self
    }

    /// Set the item pager interval
    pub fn pager_sleep(mut self, sleep: Duration) -> Self {
        self.config.pager_sleep = sleep;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
