//! Executor task driving a [`Flusher`]

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{Flusher, FlusherState};
use crate::executor::{GlobalTask, Task};

/// Runs [`Flusher::flush`] until the flusher leaves the running state
pub struct FlusherTask {
    flusher: Arc<Flusher>,
}

impl FlusherTask {
    pub fn new(flusher: Arc<Flusher>) -> Self {
        Self { flusher }
    }
}

impl Task for FlusherTask {
    fn run(&self, handle: &GlobalTask) -> bool {
        if self.flusher.state() != FlusherState::Running {
            return false;
        }

        // Never block a worker: an empty queue sleeps until the next push wakes it
        match self.flusher.flush(false) {
            Ok(0) if self.flusher.queue().is_empty() => {
                handle.snooze(self.flusher.idle_wait());
            }
            Ok(_) => handle.snooze(Duration::ZERO),
            Err(e) => {
                // The store has already reported the underlying failure
                debug!(shard = self.flusher.shard_id(), error = %e, "Flush failed; retrying");
                handle.snooze(self.flusher.idle_wait());
            }
        }
        true
    }

    fn description(&self) -> String {
        format!("Running a flusher loop: shard {}", self.flusher.shard_id())
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(5)
    }
}
