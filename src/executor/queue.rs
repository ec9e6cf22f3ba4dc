//! Task queue ordered by due time, then priority, then id

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use super::{ExTask, TaskId};

type QueueKey = (Instant, u8, TaskId);

/// Tasks known to the pool, queued or running
#[derive(Default)]
pub(crate) struct TaskQueue {
    /// Waiting tasks in run order
    waiting: BTreeMap<QueueKey, ExTask>,
    /// Position in `waiting` of each waiting task
    positions: HashMap<TaskId, QueueKey>,
    /// Every live task, waiting or running
    known: HashMap<TaskId, ExTask>,
    /// Shards with a task currently running
    busy_shards: HashSet<u16>,
}

fn key_of(task: &ExTask) -> QueueKey {
    (task.waketime(), task.priority().value, task.id())
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or re-add) a task at its current waketime
    pub fn push(&mut self, task: ExTask) {
        let key = key_of(&task);
        if let Some(old) = self.positions.insert(task.id(), key) {
            self.waiting.remove(&old);
        }
        self.known.insert(task.id(), task.clone());
        self.waiting.insert(key, task);
    }

    pub fn get(&self, id: TaskId) -> Option<&ExTask> {
        self.known.get(&id)
    }

    pub fn is_waiting(&self, id: TaskId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Take a waiting task out of the run order (it stays known)
    fn unqueue(&mut self, id: TaskId) -> Option<ExTask> {
        let key = self.positions.remove(&id)?;
        self.waiting.remove(&key)
    }

    /// Move a waiting task to a new due time
    pub fn reschedule(&mut self, id: TaskId, at: Instant) -> bool {
        match self.unqueue(id) {
            Some(task) => {
                task.set_waketime(at);
                self.push(task);
                true
            }
            None => false,
        }
    }

    /// Forget a task entirely
    pub fn reap(&mut self, id: TaskId) -> Option<ExTask> {
        self.unqueue(id);
        self.known.remove(&id)
    }

    /// Pop the first task that is due and whose shard is free
    ///
    /// Dead tasks met along the way are reaped. The returned task's shard
    /// is marked busy until [`TaskQueue::release_shard`].
    pub fn pop_ready(&mut self, now: Instant) -> Option<ExTask> {
        let mut dead = Vec::new();
        let mut chosen = None;

        for ((due, _, id), task) in &self.waiting {
            if task.is_dead() {
                dead.push(*id);
                continue;
            }
            if *due > now {
                break;
            }
            if let Some(shard) = task.serial_shard() {
                if self.busy_shards.contains(&shard) {
                    continue;
                }
            }
            chosen = Some(*id);
            break;
        }

        for id in dead {
            self.reap(id);
        }

        let task = self.unqueue(chosen?)?;
        if let Some(shard) = task.serial_shard() {
            self.busy_shards.insert(shard);
        }
        Some(task)
    }

    pub fn release_shard(&mut self, shard: u16) {
        self.busy_shards.remove(&shard);
    }

    /// Earliest due time among tasks that could run once due
    pub fn next_due(&self) -> Option<Instant> {
        self.waiting
            .iter()
            .filter(|(_, task)| {
                !task
                    .serial_shard()
                    .is_some_and(|s| self.busy_shards.contains(&s))
            })
            .map(|((due, _, _), _)| *due)
            .next()
    }

    /// Ids of every waiting task
    pub fn waiting_ids(&self) -> Vec<TaskId> {
        self.positions.keys().copied().collect()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_known(&self) -> usize {
        self.known.len()
    }
}
