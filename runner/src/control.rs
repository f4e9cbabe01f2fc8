//! Run control plane.
//!
//! One [`RunControl`] exists per run and is handed explicitly to the
//! orchestrator and to whoever drives it (CLI signal handler, HTTP routes).
//! It holds the pause/stop flags and the registry of in-flight workers.
//! Nothing here is persisted; a restarted process reconciles instead.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::io::worker::Worker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    paused: bool,
    stopping: bool,
}

#[derive(Debug)]
pub struct RunControl {
    run_id: String,
    flags: watch::Sender<Flags>,
    workers: Mutex<BTreeMap<String, Worker>>,
}

impl RunControl {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (flags, _rx) = watch::channel(Flags::default());
        Self {
            run_id: run_id.into(),
            flags,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns false if already paused or stopping.
    pub fn pause(&self) -> bool {
        let changed = self.flags.send_if_modified(|flags| {
            if flags.paused || flags.stopping {
                return false;
            }
            flags.paused = true;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "run paused");
        }
        changed
    }

    /// Clears `paused` and wakes every `wait_for_resume` caller.
    pub fn resume(&self) -> bool {
        let changed = self.flags.send_if_modified(|flags| {
            if !flags.paused || flags.stopping {
                return false;
            }
            flags.paused = false;
            true
        });
        if changed {
            info!(run_id = %self.run_id, "run resumed");
        }
        changed
    }

    /// Set `stopping` and kill every registered worker. Terminal.
    ///
    /// Returns false if the run was already stopping.
    pub fn stop(&self) -> bool {
        let changed = self.flags.send_if_modified(|flags| {
            if flags.stopping {
                return false;
            }
            flags.stopping = true;
            true
        });
        let workers: Vec<Worker> = self.workers().values().cloned().collect();
        for worker in &workers {
            worker.kill();
        }
        if changed {
            info!(run_id = %self.run_id, killed = workers.len(), "run stopping");
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.flags.borrow().paused
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.borrow().stopping
    }

    /// Completes once the run is no longer paused, or is stopping.
    pub async fn wait_for_resume(&self) {
        let mut rx = self.flags.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|f| !f.paused || f.stopping).await;
    }

    /// Completes once `stop` has been called.
    pub async fn stopped(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(|f| f.stopping).await;
    }

    /// Track an in-flight worker. A worker registered after `stop` is killed at once.
    pub fn register(&self, worker: Worker) {
        let task_id = worker.task_id().to_string();
        debug!(task_id = %task_id, pid = ?worker.pid(), "worker registered");
        if self.is_stopping() {
            worker.kill();
        }
        self.workers().insert(task_id, worker);
    }

    pub fn deregister(&self, task_id: &str) -> Option<Worker> {
        self.workers().remove(task_id)
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.workers().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.workers().len()
    }

    fn workers(&self) -> MutexGuard<'_, BTreeMap<String, Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
