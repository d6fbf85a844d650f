//! Chat and file records plus the store interfaces the engine persists through.
//! The embedding app owns the real storage; `Memory*Store` back the daemon and tests.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Which side a file transfer runs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: u64,
    pub content: String,
    pub peer_name: String,
    pub from_self: bool,
    pub created_at_ms: u64,
}

impl ChatRecord {
    /// New unsaved record (id 0, stamped now).
    pub fn new(content: &str, peer_name: &str, from_self: bool) -> Self {
        Self {
            id: 0,
            content: content.to_owned(),
            peer_name: peer_name.to_owned(),
            from_self,
            created_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub name: String,
    /// Directory the file was written to. Outbound tasks track no path.
    pub path: Option<PathBuf>,
    pub size: u64,
    pub transferred: u64,
    pub peer_name: String,
    pub from_self: bool,
    pub status: TaskStatus,
    pub created_at_ms: u64,
}

impl FileRecord {
    /// New unsaved, running record (id 0, nothing transferred).
    pub fn new(
        name: &str,
        path: Option<PathBuf>,
        size: u64,
        peer_name: &str,
        direction: Direction,
    ) -> Self {
        Self {
            id: 0,
            name: name.to_owned(),
            path,
            size,
            transferred: 0,
            peer_name: peer_name.to_owned(),
            from_self: direction == Direction::Outbound,
            status: TaskStatus::Running,
            created_at_ms: now_ms(),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.from_self {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

/// Persistence for chat messages.
pub trait ChatStore: Send + Sync {
    /// Save `record`, returning its assigned id.
    fn insert(&self, record: ChatRecord) -> u64;
}

/// Persistence for file transfer tasks.
pub trait FileStore: Send + Sync {
    /// Save `record`, returning its assigned id.
    fn insert(&self, record: FileRecord) -> u64;
    fn update_status(&self, id: u64, status: TaskStatus);
    fn update_transferred(&self, id: u64, transferred: u64);
    /// Mark every task still `Running` as `Failed` (left over from an interrupted session).
    fn abort_all_running_tasks(&self);
}

/// In-memory chat log.
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    records: Mutex<Vec<ChatRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<ChatRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChatStore for MemoryChatStore {
    fn insert(&self, mut record: ChatRecord) -> u64 {
        let mut records = lock(&self.records);
        record.id = records.len() as u64 + 1;
        let id = record.id;
        records.push(record);
        id
    }
}

/// In-memory file task table.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    records: Mutex<Vec<FileRecord>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<FileRecord> {
        lock(&self.records).clone()
    }

    pub fn get(&self, id: u64) -> Option<FileRecord> {
        lock(&self.records).iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut FileRecord)) {
        if let Some(r) = lock(&self.records).iter_mut().find(|r| r.id == id) {
            f(r);
        }
    }
}

impl FileStore for MemoryFileStore {
    fn insert(&self, mut record: FileRecord) -> u64 {
        let mut records = lock(&self.records);
        record.id = records.len() as u64 + 1;
        let id = record.id;
        records.push(record);
        id
    }

    fn update_status(&self, id: u64, status: TaskStatus) {
        self.update(id, |r| r.status = status);
    }

    fn update_transferred(&self, id: u64, transferred: u64) {
        self.update(id, |r| r.transferred = transferred);
    }

    fn abort_all_running_tasks(&self) {
        for r in lock(&self.records).iter_mut() {
            if r.status == TaskStatus::Running {
                r.status = TaskStatus::Failed;
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
