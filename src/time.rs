//! Relative time source
//!
//! Components that stamp items (dirty/queued times, deletion times, aging
//! stats) read time through a [`Clock`] handed to them at construction, so
//! tests can move time explicitly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Seconds since the clock's epoch.
pub type RelTime = u32;

/// Source of relative time
pub trait Clock: Send + Sync {
    /// Current time in seconds since this clock started
    fn now(&self) -> RelTime;
}

/// Wall clock counting from process (or engine) start
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> RelTime {
        // Offset by one so a freshly dirtied item never reads as "time 0"
        (self.start.elapsed().as_secs() as RelTime).saturating_add(1)
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start: RelTime) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Move time forward by `secs`
    pub fn advance(&self, secs: RelTime) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, secs: RelTime) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> RelTime {
        self.now.load(Ordering::SeqCst)
    }
}
