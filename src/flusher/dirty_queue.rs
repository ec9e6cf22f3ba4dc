//! Queue of keys awaiting persistence

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::executor::TaskWaker;
use crate::stats::EngineStats;
use crate::time::RelTime;

/// A key waiting to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub vbid: u16,
    pub key: Vec<u8>,
    pub queued_at: RelTime,
}

#[derive(Default)]
struct Batch {
    items: Vec<QueuedItem>,
    keys: HashSet<(u16, Vec<u8>)>,
}

/// Keys dirtied since the last flush, one entry per key
///
/// The lock is held only to push a key or swap the whole batch out.
/// Going from empty to non-empty wakes the registered flusher task.
pub struct DirtyQueue {
    batch: Mutex<Batch>,
    cond: Condvar,
    waker: Mutex<Option<TaskWaker>>,
    stats: Arc<EngineStats>,
}

impl DirtyQueue {
    pub fn new(stats: Arc<EngineStats>) -> Self {
        Self {
            batch: Mutex::new(Batch::default()),
            cond: Condvar::new(),
            waker: Mutex::new(None),
            stats,
        }
    }

    /// Task to wake when the queue stops being empty
    pub fn set_waker(&self, waker: Option<TaskWaker>) {
        *self.waker.lock() = waker;
    }

    fn notify(&self, was_empty: bool) {
        self.cond.notify_one();
        if was_empty {
            if let Some(waker) = self.waker.lock().as_ref() {
                waker.wake();
            }
        }
    }

    /// Queue a key; false if it is already in the current batch
    pub fn push(&self, vbid: u16, key: &[u8], now: RelTime) -> bool {
        let mut batch = self.batch.lock();
        if !batch.keys.insert((vbid, key.to_vec())) {
            return false;
        }
        let was_empty = batch.items.is_empty();
        batch.items.push(QueuedItem {
            vbid,
            key: key.to_vec(),
            queued_at: now,
        });
        self.stats.queue_size.add(1);
        drop(batch);
        self.notify(was_empty);
        true
    }

    /// Put items back after a failed persist (still deduplicated)
    pub fn requeue(&self, items: impl IntoIterator<Item = QueuedItem>) -> usize {
        let mut batch = self.batch.lock();
        let was_empty = batch.items.is_empty();
        let mut added = 0;
        for item in items {
            if batch.keys.insert((item.vbid, item.key.clone())) {
                batch.items.push(item);
                added += 1;
            }
        }
        self.stats.queue_size.add(added as u64);
        drop(batch);
        if added > 0 {
            self.notify(was_empty);
        }
        added
    }

    /// Take the whole batch, leaving an empty one behind
    pub fn swap(&self) -> Vec<QueuedItem> {
        let mut batch = self.batch.lock();
        let taken = std::mem::take(&mut *batch);
        self.stats.queue_size.sub(taken.items.len() as u64);
        taken.items
    }

    /// Block until something is queued or `timeout` passes
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut batch = self.batch.lock();
        if batch.items.is_empty() {
            self.cond.wait_for(&mut batch, timeout);
        }
        !batch.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
