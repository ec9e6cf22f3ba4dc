//! Worker thread pool
//!
//! Workers sleep on a condition variable until the earliest due task,
//! run it without holding the queue lock, then put it back (or reap it).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::queue::TaskQueue;
use super::{ExTask, TaskId};

struct Shared {
    queue: Mutex<TaskQueue>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn wake(&self, id: TaskId) -> bool {
        let mut queue = self.queue.lock();
        if queue.reschedule(id, Instant::now()) {
            drop(queue);
            self.cond.notify_all();
            return true;
        }
        match queue.get(id) {
            Some(task) => {
                task.note_woken();
                true
            }
            None => false,
        }
    }
}

/// Wakes one task; see [`ExecutorPool::wake`]
#[derive(Clone)]
pub struct TaskWaker {
    shared: Arc<Shared>,
    id: TaskId,
}

impl TaskWaker {
    pub fn wake(&self) -> bool {
        self.shared.wake(self.id)
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

/// Fixed pool of worker threads running scheduled tasks
pub struct ExecutorPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorPool {
    /// Start `num_workers` worker threads (at least one)
    pub fn new(num_workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..num_workers.max(1))
            .filter_map(|i| {
                let shared = shared.clone();
                let spawned = thread::Builder::new()
                    .name(format!("epkv-worker-{i}"))
                    .spawn(move || worker_loop(shared));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(worker = i, error = %e, "Failed to spawn worker thread");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), "Executor pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task; it runs once its waketime passes
    pub fn schedule(&self, task: ExTask) -> TaskId {
        let id = task.id();
        if self.shared.shutdown.load(Ordering::Acquire) {
            debug!(task = %task.description(), "Task scheduled after shutdown; dropped");
            task.cancel();
            return id;
        }
        trace!(task = %task.description(), id, "Scheduling task");
        self.shared.queue.lock().push(task);
        self.shared.cond.notify_all();
        id
    }

    /// Make a task due now
    ///
    /// A task that is currently running is requeued immediately when it
    /// finishes, whatever it snoozed itself to.
    pub fn wake(&self, id: TaskId) -> bool {
        self.shared.wake(id)
    }

    /// Handle that wakes task `id` without borrowing the pool
    pub fn waker(&self, id: TaskId) -> TaskWaker {
        TaskWaker {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Push a waiting task's due time to `duration` from now
    pub fn snooze(&self, id: TaskId, duration: Duration) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.reschedule(id, Instant::now() + duration) {
            return true;
        }
        match queue.get(id) {
            Some(task) => {
                task.snooze(duration);
                true
            }
            None => false,
        }
    }

    /// Mark a task dead; a running task finishes its current run first
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut queue = self.shared.queue.lock();
        let Some(task) = queue.get(id).cloned() else {
            return false;
        };
        task.cancel();
        if queue.is_waiting(id) {
            queue.reap(id);
        }
        true
    }

    /// Tasks waiting or running
    pub fn num_tasks(&self) -> usize {
        self.shared.queue.lock().num_known()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the pool
    ///
    /// Waiting tasks that do not block shutdown are cancelled; the rest run
    /// one final time. Returns once every worker has exited.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            let now = Instant::now();
            for id in queue.waiting_ids() {
                let Some(task) = queue.get(id).cloned() else {
                    continue;
                };
                if task.blocks_shutdown() {
                    queue.reschedule(id, now);
                } else {
                    task.cancel();
                    queue.reap(id);
                }
            }
        }
        self.shared.cond.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        info!("Executor pool stopped");
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_ready(Instant::now()) {
                    break task;
                }
                if shared.shutdown.load(Ordering::Acquire) && queue.num_waiting() == 0 {
                    return;
                }
                match queue.next_due() {
                    Some(due) => {
                        shared.cond.wait_until(&mut queue, due);
                    }
                    None => shared.cond.wait(&mut queue),
                }
            }
        };

        run_one(&shared, task);
    }
}

fn run_one(shared: &Shared, task: ExTask) {
    let started = Instant::now();
    let again = !task.is_dead()
        && match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
            Ok(again) => again,
            Err(payload) => {
                error!(
                    task = %task.description(),
                    id = task.id(),
                    panic = panic_message(payload.as_ref()),
                    "Task panicked; cancelling it"
                );
                false
            }
        };
    let elapsed = started.elapsed();

    if elapsed > task.max_expected_duration() {
        warn!(
            task = %task.description(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Task ran longer than expected"
        );
    }

    let mut queue = shared.queue.lock();
    if let Some(shard) = task.serial_shard() {
        queue.release_shard(shard);
    }

    let shutting_down = shared.shutdown.load(Ordering::Acquire);
    if again && !task.is_dead() && !shutting_down {
        if task.take_woken() {
            task.set_waketime(Instant::now());
        }
        queue.push(task);
    } else {
        trace!(task = %task.description(), id = task.id(), "Reaping task");
        task.cancel();
        queue.reap(task.id());
    }
    drop(queue);
    shared.cond.notify_all();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
