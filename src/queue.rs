//! Task queue - pending FIFO plus running bindings
//!
//! Owned by the supervisor loop; nothing else mutates it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, VigilError};
use crate::snapshot::{BindingRecord, Snapshot};
use crate::types::{Task, TaskId, TaskKind, TaskOrigin, TaskOutcome, WorkerId};

/// Terminal outcomes kept for status queries.
const HISTORY_LIMIT: usize = 1_000;

/// A task bound to the worker executing it
#[derive(Debug, Clone)]
pub struct Binding {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub soft_warned: bool,
    pub cancel_requested: Option<Instant>,
}

impl Binding {
    pub fn record(&self) -> BindingRecord {
        BindingRecord {
            task: self.task.clone(),
            worker_id: self.worker_id,
            started_at: self.started_at,
        }
    }
}

/// Where a task currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running(WorkerId),
    Cancelling(WorkerId),
    Done(TaskOutcome),
}

/// Result of [`TaskQueue::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// Was pending; now recorded as cancelled.
    Removed,
    /// Running; the bound worker must be signalled.
    Signal(WorkerId),
    /// Already being cancelled.
    AlreadyCancelling(WorkerId),
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
    running: HashMap<TaskId, Binding>,
    finished: HashMap<TaskId, TaskOutcome>,
    finished_order: VecDeque<TaskId>,
    paused: BTreeSet<TaskKind>,
    revision: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task. A second singleton-kind task is rejected.
    pub fn enqueue(&mut self, task: Task) -> Result<TaskId> {
        if task.kind.is_singleton() && self.has_active(task.kind) {
            warn!(kind = %task.kind, "duplicate singleton task rejected");
            return Err(VigilError::Duplicate(task.kind));
        }
        let id = task.id;
        debug!(task_id = %id, kind = %task.kind, "task queued");
        self.pending.push_back(task);
        self.revision += 1;
        Ok(id)
    }

    /// Put recovered tasks at the head of the queue, preserving their order.
    pub fn requeue_front(&mut self, tasks: Vec<Task>) {
        for task in tasks.into_iter().rev() {
            if self.contains(task.id) {
                continue;
            }
            self.pending.push_front(Task {
                origin: TaskOrigin::Recovered,
                ..task
            });
        }
        self.revision += 1;
    }

    fn has_active(&self, kind: TaskKind) -> bool {
        self.pending.iter().any(|t| t.kind == kind) || self.running.values().any(|b| b.task.kind == kind)
    }

    fn contains(&self, id: TaskId) -> bool {
        self.running.contains_key(&id) || self.pending.iter().any(|t| t.id == id)
    }

    /// Bind pending tasks to idle workers, in FIFO order.
    ///
    /// Tasks of paused kinds are skipped and keep their position.
    pub fn assign(&mut self, idle: &[WorkerId]) -> Vec<(Task, WorkerId)> {
        let mut workers = idle.iter().copied();
        let mut assigned = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            if self.paused.contains(&self.pending[index].kind) {
                index += 1;
                continue;
            }
            let Some(worker_id) = workers.next() else {
                break;
            };
            let Some(task) = self.pending.remove(index) else {
                break;
            };
            self.running.insert(
                task.id,
                Binding {
                    task: task.clone(),
                    worker_id,
                    started_at: Utc::now(),
                    started: Instant::now(),
                    soft_warned: false,
                    cancel_requested: None,
                },
            );
            assigned.push((task, worker_id));
        }
        if !assigned.is_empty() {
            self.revision += 1;
        }
        assigned
    }

    /// Undo an assignment whose dispatch failed; the task goes back to the front.
    pub fn unassign(&mut self, task_id: TaskId) {
        if let Some(binding) = self.running.remove(&task_id) {
            self.pending.push_front(binding.task);
            self.revision += 1;
        }
    }

    pub fn cancel(&mut self, task_id: TaskId, now: Instant) -> Result<Cancelled> {
        if let Some(pos) = self.pending.iter().position(|t| t.id == task_id) {
            self.pending.remove(pos);
            self.finish(task_id, TaskOutcome::Cancelled);
            info!(task_id = %task_id, "pending task cancelled");
            return Ok(Cancelled::Removed);
        }
        match self.running.get_mut(&task_id) {
            Some(binding) if binding.cancel_requested.is_some() => {
                Ok(Cancelled::AlreadyCancelling(binding.worker_id))
            }
            Some(binding) => {
                binding.cancel_requested = Some(now);
                self.revision += 1;
                info!(task_id = %task_id, worker_id = %binding.worker_id, "running task cancelling");
                Ok(Cancelled::Signal(binding.worker_id))
            }
            None => Err(VigilError::NotFound(task_id)),
        }
    }

    /// Record a terminal outcome. Returns the binding if the task was running.
    ///
    /// Completing a task that is no longer running (already timed out,
    /// killed, or finished) is a no-op.
    pub fn complete(&mut self, task_id: TaskId, outcome: TaskOutcome) -> Option<Binding> {
        let binding = self.running.remove(&task_id)?;
        info!(
            task_id = %task_id,
            worker_id = %binding.worker_id,
            elapsed_ms = binding.started.elapsed().as_millis() as u64,
            %outcome,
            "task completed"
        );
        self.finish(task_id, outcome);
        Some(binding)
    }

    fn finish(&mut self, task_id: TaskId, outcome: TaskOutcome) {
        self.finished.insert(task_id, outcome);
        self.finished_order.push_back(task_id);
        while self.finished_order.len() > HISTORY_LIMIT {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
        self.revision += 1;
    }

    pub fn mark_soft_warned(&mut self, task_id: TaskId) {
        if let Some(binding) = self.running.get_mut(&task_id) {
            binding.soft_warned = true;
        }
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        if let Some(b) = self.running.get(&task_id) {
            return Some(match b.cancel_requested {
                Some(_) => TaskState::Cancelling(b.worker_id),
                None => TaskState::Running(b.worker_id),
            });
        }
        if self.pending.iter().any(|t| t.id == task_id) {
            return Some(TaskState::Pending);
        }
        self.finished.get(&task_id).cloned().map(TaskState::Done)
    }

    pub fn binding(&self, task_id: TaskId) -> Option<&Binding> {
        self.running.get(&task_id)
    }

    pub fn binding_for_worker(&self, worker_id: WorkerId) -> Option<&Binding> {
        self.running.values().find(|b| b.worker_id == worker_id)
    }

    pub fn running(&self) -> impl Iterator<Item = &Binding> {
        self.running.values()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Task> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn pause(&mut self, kind: TaskKind) -> bool {
        let changed = self.paused.insert(kind);
        if changed {
            info!(kind = %kind, "kind paused");
        }
        changed
    }

    pub fn resume(&mut self, kind: TaskKind) -> bool {
        let changed = self.paused.remove(&kind);
        if changed {
            info!(kind = %kind, "kind resumed");
        }
        changed
    }

    pub fn paused(&self) -> Vec<TaskKind> {
        self.paused.iter().copied().collect()
    }

    /// Bumped on every change; used to skip redundant snapshot writes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self, reason: &str) -> Snapshot {
        let mut running: Vec<BindingRecord> = self.running.values().map(Binding::record).collect();
        running.sort_by_key(|r| r.started_at);
        Snapshot {
            pending_tasks: self.pending.iter().cloned().collect(),
            running_bindings: running,
            written_at: Utc::now(),
            reason: reason.to_string(),
        }
    }
}
