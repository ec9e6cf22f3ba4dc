//! Executor Module
//!
//! Cooperative scheduling of background work on a fixed worker pool.
//!
//! ## Responsibilities
//! - Order runnable tasks by (due time, priority, id)
//! - Keep tasks that share a shard tag from running concurrently
//! - Snooze, wake and cancel tasks by id
//! - Shutdown: abandon ordinary tasks, give `block_shutdown` tasks a final run
//! - A task that panics is logged and reaped; its shard is released
//!
//! ## Task Lifecycle
//! ```text
//!   schedule() ──► queued ──(due, shard free)──► running ──run() = true──► queued
//!                    │                              │
//!                 cancel()                     run() = false
//!                    ▼                              ▼
//!                  dead ──────────────────────►  reaped
//! ```
//! A task is an `Arc<GlobalTask>` shared by the queue, the pool's id index
//! and whichever worker is running it.

mod pool;
mod queue;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use pool::{ExecutorPool, TaskWaker};

/// Unique, monotonically assigned task identifier
pub type TaskId = u64;

/// Shared handle to a scheduled task
pub type ExTask = Arc<GlobalTask>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduling priority; lower values run first among tasks due together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub name: &'static str,
    pub value: u8,
}

impl Priority {
    pub const BG_FETCHER: Priority = Priority {
        name: "BgFetcherPriority",
        value: 0,
    };
    pub const VBUCKET_PERSIST_HIGH: Priority = Priority {
        name: "VBucketPersistHighPriority",
        value: 0,
    };
    pub const VBUCKET_DELETION: Priority = Priority {
        name: "VBucketDeletionPriority",
        value: 1,
    };
    pub const COMPACTOR: Priority = Priority {
        name: "CompactorPriority",
        value: 2,
    };
    pub const FLUSHER: Priority = Priority {
        name: "FlusherPriority",
        value: 5,
    };
    pub const ITEM_PAGER: Priority = Priority {
        name: "ItemPagerPriority",
        value: 7,
    };
    pub const VBUCKET_PERSIST_LOW: Priority = Priority {
        name: "VBucketPersistLowPriority",
        value: 9,
    };
}

/// Work performed by a scheduled task
pub trait Task: Send + Sync {
    /// Do one unit of work; return true to be scheduled again
    ///
    /// `handle` lets the task snooze itself before returning.
    fn run(&self, handle: &GlobalTask) -> bool;

    fn description(&self) -> String;

    /// Runs longer than this are reported
    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(3600)
    }
}

const TASK_RUNNING: u8 = 0;
const TASK_DEAD: u8 = 1;

/// Scheduling state wrapped around a [`Task`]
pub struct GlobalTask {
    id: TaskId,
    priority: Priority,
    block_shutdown: bool,
    serial_shard: Option<u16>,
    state: AtomicU8,
    waketime: Mutex<Instant>,
    woken: AtomicBool,
    task: Box<dyn Task>,
}

impl GlobalTask {
    /// Wrap `task`, first due after `sleep`
    pub fn new(
        task: impl Task + 'static,
        priority: Priority,
        sleep: Duration,
        block_shutdown: bool,
    ) -> ExTask {
        Self::build(Box::new(task), priority, sleep, block_shutdown, None)
    }

    /// Like [`GlobalTask::new`], but never run concurrently with another
    /// task tagged with the same shard
    pub fn with_shard(
        task: impl Task + 'static,
        priority: Priority,
        sleep: Duration,
        block_shutdown: bool,
        shard: u16,
    ) -> ExTask {
        Self::build(Box::new(task), priority, sleep, block_shutdown, Some(shard))
    }

    fn build(
        task: Box<dyn Task>,
        priority: Priority,
        sleep: Duration,
        block_shutdown: bool,
        serial_shard: Option<u16>,
    ) -> ExTask {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            priority,
            block_shutdown,
            serial_shard,
            state: AtomicU8::new(TASK_RUNNING),
            waketime: Mutex::new(Instant::now() + sleep),
            woken: AtomicBool::new(false),
            task,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Must run to completion even while shutting down
    pub fn blocks_shutdown(&self) -> bool {
        self.block_shutdown
    }

    pub fn serial_shard(&self) -> Option<u16> {
        self.serial_shard
    }

    pub fn description(&self) -> String {
        self.task.description()
    }

    pub fn max_expected_duration(&self) -> Duration {
        self.task.max_expected_duration()
    }

    pub fn is_dead(&self) -> bool {
        self.state.load(Ordering::Acquire) == TASK_DEAD
    }

    /// Mark dead; it will not be scheduled again
    pub fn cancel(&self) {
        self.state.store(TASK_DEAD, Ordering::Release);
    }

    pub fn waketime(&self) -> Instant {
        *self.waketime.lock()
    }

    /// Set the next due time to `duration` from now
    pub fn snooze(&self, duration: Duration) {
        *self.waketime.lock() = Instant::now() + duration;
    }

    pub(crate) fn set_waketime(&self, at: Instant) {
        *self.waketime.lock() = at;
    }

    /// Remember a wake that arrived while the task was running
    pub(crate) fn note_woken(&self) {
        self.woken.store(true, Ordering::Release);
    }

    pub(crate) fn take_woken(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn execute(&self) -> bool {
        self.task.run(self)
    }
}

impl std::fmt::Debug for GlobalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTask")
            .field("id", &self.id)
            .field("description", &self.description())
            .field("priority", &self.priority.name)
            .field("serial_shard", &self.serial_shard)
            .field("dead", &self.is_dead())
            .finish()
    }
}
