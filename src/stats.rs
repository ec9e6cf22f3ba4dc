//! Engine-wide statistics
//!
//! Counters are plain relaxed atomics shared through an `Arc<EngineStats>`.
//! They are exported as key/value pairs through a stats callback; the
//! transport that renders them is not this crate's concern.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Value that is overwritten, with an optional high-water mark
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Lower by `value`, stopping at zero
    pub fn sub(&self, value: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(value))
            });
    }

    /// Raise to `value` if it is higher than the current value
    pub fn set_max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Statistics shared by all components of one engine
#[derive(Debug, Default)]
pub struct EngineStats {
    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------
    /// Bytes accounted to stored values across every hash table
    pub current_size: AtomicUsize,

    /// Mutations refused by the memory quota check
    pub tmp_oom_errors: Counter,

    // -------------------------------------------------------------------------
    // Dirty queue / flusher
    // -------------------------------------------------------------------------
    /// Keys currently queued for persistence, across every shard
    pub queue_size: Gauge,

    /// Keys in batches currently being flushed, across every shard
    pub flusher_todo: Gauge,

    /// Items persisted successfully
    pub total_persisted: Counter,

    /// Items whose write was not committed
    pub flusher_commit_failed: Counter,

    /// Items found clean at flush time (already written by an earlier batch)
    pub flusher_skipped: Counter,

    /// Seconds between queueing and persisting the last item
    pub dirty_age: Gauge,
    pub dirty_age_high_wat: Gauge,

    /// Seconds between the last value change and persisting the last item
    pub data_age: Gauge,
    pub data_age_high_wat: Gauge,

    /// Milliseconds spent in the last flush / commit
    pub flush_duration: Gauge,
    pub flush_duration_high_wat: Gauge,
    pub commit_time: Gauge,

    // -------------------------------------------------------------------------
    // Background fetch / eviction
    // -------------------------------------------------------------------------
    /// Background fetches completed
    pub bg_fetched: Counter,

    /// Background fetches that could not be served
    pub bg_fetch_failed: Counter,

    /// Values ejected by the pager or explicit eviction
    pub num_value_ejects: Counter,

    /// Pager runs that ejected anything
    pub pager_runs: Counter,

    /// Requests refused for a non-active vbucket
    pub num_not_my_vbuckets: Counter,

    /// Expired items removed by compaction
    pub expired_compactor: Counter,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current memory usage in bytes
    pub fn mem_used(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    pub(crate) fn mem_add(&self, bytes: usize) {
        self.current_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn mem_sub(&self, bytes: usize) {
        self.current_size.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Emit every counter as a key/value pair
    pub fn add_stats(&self, add_stat: &mut dyn FnMut(&str, &str)) {
        let mut emit = |name: &str, value: u64| add_stat(name, &value.to_string());

        emit("mem_used", self.mem_used() as u64);
        emit("ep_tmp_oom_errors", self.tmp_oom_errors.value());
        emit("ep_queue_size", self.queue_size.value());
        emit("ep_flusher_todo", self.flusher_todo.value());
        emit("ep_total_persisted", self.total_persisted.value());
        emit("ep_item_commit_failed", self.flusher_commit_failed.value());
        emit("ep_flusher_skipped", self.flusher_skipped.value());
        emit("ep_dirty_age", self.dirty_age.value());
        emit("ep_dirty_age_highwat", self.dirty_age_high_wat.value());
        emit("ep_data_age", self.data_age.value());
        emit("ep_data_age_highwat", self.data_age_high_wat.value());
        emit("ep_flush_duration", self.flush_duration.value());
        emit("ep_flush_duration_highwat", self.flush_duration_high_wat.value());
        emit("ep_commit_time", self.commit_time.value());
        emit("ep_bg_fetched", self.bg_fetched.value());
        emit("ep_bg_fetch_failed", self.bg_fetch_failed.value());
        emit("ep_num_value_ejects", self.num_value_ejects.value());
        emit("ep_num_pager_runs", self.pager_runs.value());
        emit("ep_num_not_my_vbuckets", self.num_not_my_vbuckets.value());
        emit("ep_expired_compactor", self.expired_compactor.value());
    }
}
