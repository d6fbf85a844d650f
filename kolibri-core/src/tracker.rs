//! Per-file transfer bookkeeping: creates the task record, accumulates progress with
//! rate-limited persistence, and settles the task exactly once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::events::EventSink;
use crate::store::{Direction, FileRecord, FileStore, TaskStatus};

/// Progress is written to the store at most once per this window.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Active { id: u64 },
    /// Terminal. `id` is absent when the task never started.
    Finished { id: Option<u64>, status: TaskStatus },
}

#[derive(Debug)]
struct Progress {
    phase: Phase,
    size: u64,
    transferred: u64,
    last_persist: Option<Instant>,
}

/// Tracker for one transfer. All methods take `&self` and serialize internally.
pub struct TransferTracker {
    files: Arc<dyn FileStore>,
    events: Arc<dyn EventSink>,
    peer_name: String,
    progress: Mutex<Progress>,
}

impl TransferTracker {
    pub fn new(files: Arc<dyn FileStore>, events: Arc<dyn EventSink>, peer_name: &str) -> Self {
        Self {
            files,
            events,
            peer_name: peer_name.to_owned(),
            progress: Mutex::new(Progress {
                phase: Phase::Idle,
                size: 0,
                transferred: 0,
                last_persist: None,
            }),
        }
    }

    /// Create and persist the task record. No-op once the tracker is running or finished.
    pub fn start(&self, name: &str, path: Option<PathBuf>, size: u64, direction: Direction) {
        let mut p = self.lock();
        if p.phase != Phase::Idle {
            return;
        }
        let mut record = FileRecord::new(name, path, size, &self.peer_name, direction);
        let id = self.files.insert(record.clone());
        record.id = id;
        p.phase = Phase::Active { id };
        p.size = size;
        debug!(id, name, size, ?direction, "transfer task started");
        self.events.on_new_task(&record);
    }

    /// Add `delta` transferred bytes. Returns true once the whole file has been transferred.
    /// Does nothing (and returns false) unless the task is running.
    pub fn proceed(&self, delta: u64) -> bool {
        let mut p = self.lock();
        let Phase::Active { id } = p.phase else {
            return false;
        };
        p.transferred = p.transferred.saturating_add(delta);
        let now = Instant::now();
        let due = p
            .last_persist
            .map_or(true, |last| now.duration_since(last) >= PERSIST_INTERVAL);
        if due {
            self.files.update_transferred(id, p.transferred);
            p.last_persist = Some(now);
        }
        p.transferred >= p.size
    }

    /// Bytes still expected. Zero unless the task is running.
    pub fn remaining(&self) -> u64 {
        let p = self.lock();
        match p.phase {
            Phase::Active { .. } => p.size.saturating_sub(p.transferred),
            _ => 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn transferred(&self) -> u64 {
        self.lock().transferred
    }

    /// Store id of the task, once started.
    pub fn id(&self) -> Option<u64> {
        match self.lock().phase {
            Phase::Idle => None,
            Phase::Active { id } => Some(id),
            Phase::Finished { id, .. } => id,
        }
    }

    /// `None` before start, `Running` while active, then the terminal status.
    pub fn status(&self) -> Option<TaskStatus> {
        match self.lock().phase {
            Phase::Idle => None,
            Phase::Active { .. } => Some(TaskStatus::Running),
            Phase::Finished { status, .. } => Some(status),
        }
    }

    /// Settle the task as completed or failed. Only the first call has any effect;
    /// afterwards the tracker is inert.
    pub fn finish(&self, completed: bool) {
        let mut p = self.lock();
        let status = if completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        match p.phase {
            Phase::Finished { .. } => {}
            Phase::Idle => {
                p.phase = Phase::Finished { id: None, status };
            }
            Phase::Active { id } => {
                self.files.update_transferred(id, p.transferred);
                self.files.update_status(id, status);
                p.phase = Phase::Finished {
                    id: Some(id),
                    status,
                };
                debug!(id, ?status, transferred = p.transferred, "transfer task finished");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
