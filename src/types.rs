//! Core data model shared by every component

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, VigilError};

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Worker slot identifier, assigned sequentially by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// What kind of work a task is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Requested by the owner
    User,
    /// Self-scheduled evolution cycle; at most one in flight
    Evolution,
    /// Review of previous work
    Review,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::User, TaskKind::Evolution, TaskKind::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Evolution => "evolution",
            Self::Review => "review",
        }
    }

    /// Kinds the queue de-duplicates: only one may be pending or running.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Evolution)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "evolution" => Ok(Self::Evolution),
            "review" => Ok(Self::Review),
            other => Err(VigilError::InvalidTask(format!("unknown task kind '{other}'"))),
        }
    }
}

/// Who asked for the task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskOrigin {
    Owner,
    Scheduler,
    /// Spawned by another task
    Task { parent: TaskId },
    /// Re-queued from a recovery snapshot
    Recovered,
}

impl Default for TaskOrigin {
    fn default() -> Self {
        Self::Owner
    }
}

/// An immutable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub origin: TaskOrigin,
}

impl Task {
    /// Create a task, rejecting empty payloads.
    pub fn new(kind: TaskKind, payload: Value, origin: TaskOrigin) -> Result<Self> {
        if payload_is_empty(&payload) {
            return Err(VigilError::InvalidTask(format!("{kind} task has an empty payload")));
        }
        Ok(Self {
            id: TaskId::new(),
            kind,
            payload,
            created_at: Utc::now(),
            origin,
        })
    }

    /// Short human-readable rendering of the payload for prompts and logs.
    pub fn summary(&self, max_chars: usize) -> String {
        let text = match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("prompt"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| self.payload.to_string()),
            other => other.to_string(),
        };
        truncate_chars(&text, max_chars)
    }
}

fn payload_is_empty(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Untrusted task descriptor as it arrives at the boundary (UI, API, file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub kind: Option<String>,
    pub payload: Option<Value>,
    #[serde(default)]
    pub origin: TaskOrigin,
}

impl TaskRequest {
    pub fn into_task(self) -> Result<Task> {
        let kind = self
            .kind
            .ok_or_else(|| VigilError::InvalidTask("missing kind".into()))?
            .parse::<TaskKind>()?;
        let payload = self
            .payload
            .ok_or_else(|| VigilError::InvalidTask("missing payload".into()))?;
        Task::new(kind, payload, self.origin)
    }
}

/// Why a task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum FailureReason {
    Timeout,
    WorkerCrash,
    RoundLimit,
    /// Ledger crossed its ceiling; stopped after the step in hand.
    Budget,
    Backend(String),
    Error(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::WorkerCrash => f.write_str("worker crash"),
            Self::RoundLimit => f.write_str("round limit"),
            Self::Budget => f.write_str("budget exceeded"),
            Self::Backend(msg) => write!(f, "backend: {msg}"),
            Self::Error(msg) => f.write_str(msg),
        }
    }
}

/// Terminal state of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TaskOutcome {
    Success { summary: String },
    Failed { reason: FailureReason },
    Cancelled,
}

impl TaskOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        Self::Failed { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { .. } => f.write_str("success"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Safety classification of a proposed mutating action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Safe,
    Suspicious,
    Dangerous,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Suspicious => "SUSPICIOUS",
            Self::Dangerous => "DANGEROUS",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(Self::Safe),
            "SUSPICIOUS" => Ok(Self::Suspicious),
            "DANGEROUS" => Ok(Self::Dangerous),
            other => Err(VigilError::Backend(format!("unrecognised verdict '{other}'"))),
        }
    }
}

/// Ledger category for a cost entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    /// Auxiliary model spend (safety evaluation, escalation)
    Model,
    /// Spend by a task's own reasoning loop
    Task,
}

impl fmt::Display for CostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => f.write_str("model"),
            Self::Task => f.write_str("task"),
        }
    }
}
