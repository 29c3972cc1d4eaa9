//! Structured events and the worker → supervisor event bus
//!
//! Every worker owns an [`EventSender`] clone of a single bounded channel.
//! Events from one sender arrive in emission order; nothing is promised
//! across senders. When the channel is full the sender waits a bounded slice
//! of time and tries again instead of dropping: a lost cost or safety event
//! would break ledger accounting.
//!
//! Senders handed to workers stamp every event with the worker's id, so the
//! supervisor can drop reports from a worker that no longer owns the task.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tracing::warn;

use crate::error::{Result, VigilError};
use crate::types::{CostCategory, TaskId, TaskKind, TaskOutcome, Verdict, WorkerId};

/// Event emitted by workers, the pool, or the supervisor itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskQueued {
        task_id: TaskId,
        kind: TaskKind,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    Progress {
        task_id: TaskId,
        text: String,
    },
    ToolCall {
        task_id: TaskId,
        tool: String,
        args_digest: String,
        result_digest: String,
    },
    CostEntry {
        task_id: Option<TaskId>,
        model: String,
        category: CostCategory,
        amount: Decimal,
    },
    SafetyVerdict {
        task_id: TaskId,
        tool: String,
        verdict: Verdict,
        reasoning: String,
    },
    TaskCancelling {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskDone {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    TimeoutWarning {
        task_id: TaskId,
        elapsed_ms: u64,
    },
    WorkerCrashed {
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        reason: String,
    },
    WorkerKilled {
        worker_id: WorkerId,
        reason: String,
    },
    BudgetExceeded {
        spent: Decimal,
        ceiling: Decimal,
    },
    CrashStorm {
        crashes: usize,
        window_ms: u64,
    },
    Control {
        command: String,
        detail: String,
    },
    /// Liveness ping; consumed by the supervisor, never fanned out
    Heartbeat {
        worker_id: WorkerId,
    },
}

/// How urgently an event needs a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Info,
    Warning,
    Fatal,
}

impl Event {
    pub fn priority(&self) -> Priority {
        match self {
            Self::BudgetExceeded { .. } | Self::CrashStorm { .. } => Priority::Fatal,
            Self::WorkerCrashed { .. } | Self::WorkerKilled { .. } | Self::TimeoutWarning { .. } => {
                Priority::Warning
            }
            Self::SafetyVerdict { verdict, .. } if *verdict != Verdict::Safe => Priority::Warning,
            Self::TaskDone { outcome, .. } if !outcome.is_success() => Priority::Warning,
            _ => Priority::Info,
        }
    }

    /// Partition used by the on-disk event log.
    pub fn category(&self) -> &'static str {
        match self {
            Self::TaskQueued { .. }
            | Self::TaskStarted { .. }
            | Self::TaskCancelling { .. }
            | Self::TaskDone { .. }
            | Self::TimeoutWarning { .. } => "tasks",
            Self::Progress { .. } => "progress",
            Self::ToolCall { .. } => "tools",
            Self::CostEntry { .. } | Self::BudgetExceeded { .. } => "costs",
            Self::SafetyVerdict { .. } => "safety",
            Self::WorkerCrashed { .. }
            | Self::WorkerKilled { .. }
            | Self::CrashStorm { .. }
            | Self::Heartbeat { .. } => "workers",
            Self::Control { .. } => "supervisor",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskQueued { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::ToolCall { task_id, .. }
            | Self::SafetyVerdict { task_id, .. }
            | Self::TaskCancelling { task_id, .. }
            | Self::TaskDone { task_id, .. }
            | Self::TimeoutWarning { task_id, .. } => Some(*task_id),
            Self::CostEntry { task_id, .. } | Self::WorkerCrashed { task_id, .. } => *task_id,
            _ => None,
        }
    }

    /// Internal events stay inside the supervisor.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }
}

/// First 16 hex chars of the SHA-256 of `data`.
pub fn digest(data: &str) -> String {
    let hash = Sha256::digest(data.as_bytes());
    hex::encode(&hash[..8])
}

/// An event as it travels the bus, stamped with the worker that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// `None` for events raised outside any worker.
    pub origin: Option<WorkerId>,
    pub event: Event,
}

/// Producer half of the event bus
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Envelope>,
    backpressure_wait: Duration,
    origin: Option<WorkerId>,
}

impl EventSender {
    /// A sender whose events are attributed to `worker_id`.
    pub fn for_worker(&self, worker_id: WorkerId) -> Self {
        Self {
            origin: Some(worker_id),
            ..self.clone()
        }
    }

    pub fn origin(&self) -> Option<WorkerId> {
        self.origin
    }

    /// Deliver an event, waiting out saturation rather than dropping it.
    ///
    /// Fails only when the supervisor side has gone away.
    pub async fn emit(&self, event: Event) -> Result<()> {
        let mut pending = Envelope {
            origin: self.origin,
            event,
        };
        let mut attempts = 0u32;
        loop {
            match self.tx.send_timeout(pending, self.backpressure_wait).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(envelope)) => {
                    attempts += 1;
                    if attempts % 20 == 1 {
                        warn!(
                            attempts,
                            category = envelope.event.category(),
                            "event channel saturated, retrying"
                        );
                    }
                    pending = envelope;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(VigilError::ChannelClosed),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the supervisor loop
pub struct EventReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl EventReceiver {
    /// Take up to `max` buffered envelopes without waiting.
    pub fn drain_envelopes(&mut self, max: usize) -> Vec<Envelope> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(envelope) => out.push(envelope),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Take up to `max` buffered events without waiting.
    pub fn drain(&mut self, max: usize) -> Vec<Event> {
        self.drain_envelopes(max).into_iter().map(|e| e.event).collect()
    }

    /// Wait for the next event (used by tests and simple consumers).
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await.map(|e| e.event)
    }
}

/// Create the bounded event bus.
pub fn event_bus(capacity: usize, backpressure_wait: Duration) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            backpressure_wait,
            origin: None,
        },
        EventReceiver { rx },
    )
}
