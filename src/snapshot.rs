//! Recovery snapshot of the task queue.
//!
//! Written by the supervisor loop whenever the queue changed since the last
//! write. It is context for crash recovery, not a write-ahead log: the live
//! queue stays authoritative while the process runs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::ledger::write_atomic;
use crate::types::{Task, WorkerId};

/// A running binding as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
}

/// Serialized queue state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pending_tasks: Vec<Task>,
    pub running_bindings: Vec<BindingRecord>,
    pub written_at: DateTime<Utc>,
    pub reason: String,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.pending_tasks.is_empty() && self.running_bindings.is_empty()
    }

    /// Tasks to re-queue after a restart: interrupted work first (its worker
    /// is gone), then the pending backlog in order.
    pub fn tasks_to_resume(&self) -> Vec<Task> {
        self.running_bindings
            .iter()
            .map(|b| b.task.clone())
            .chain(self.pending_tasks.iter().cloned())
            .collect()
    }
}

/// Location of the snapshot file
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(snapshot)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        debug!(
            pending = snapshot.pending_tasks.len(),
            running = snapshot.running_bindings.len(),
            reason = %snapshot.reason,
            "queue snapshot written"
        );
        Ok(())
    }

    /// Read the last snapshot. A missing or unreadable file yields `None`.
    pub fn load(&self) -> Option<Snapshot> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable queue snapshot");
                None
            }
        }
    }
}
