//! Supervisor error types

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{TaskId, TaskKind, WorkerId};

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors that can occur in the supervisor
#[derive(Debug, Error)]
pub enum VigilError {
    /// Malformed enqueue, rejected at the boundary
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Unknown task id
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// A task of a self-scheduling kind is already pending or running
    #[error("Task of kind {0} is already pending or running")]
    Duplicate(TaskKind),

    /// A tool call ran past its deadline
    #[error("Tool {tool} timed out after {}ms", .after.as_millis())]
    ToolTimeout { tool: String, after: Duration },

    /// A worker died while holding a task
    #[error("Worker {worker_id} crashed")]
    WorkerCrash { worker_id: WorkerId },

    /// The safety gate refused an action
    #[error("Safety violation: {reasoning}")]
    SafetyViolation { reasoning: String },

    /// Spend crossed the budget ceiling
    #[error("Budget exceeded: spent ${spent} of ${ceiling}")]
    BudgetExceeded { spent: Decimal, ceiling: Decimal },

    /// Too many worker crashes inside the rolling window
    #[error("Crash storm: {crashes} worker crashes within {}s", .window.as_secs())]
    CrashStorm { crashes: usize, window: Duration },

    /// Reasoning backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Tool failure
    #[error("Tool error: {0}")]
    Tool(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel error
    #[error("Channel closed")]
    ChannelClosed,

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML decoding error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl VigilError {
    /// Short machine-readable category, used in events and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidTask(_) => "invalid_task",
            Self::NotFound(_) => "not_found",
            Self::Duplicate(_) => "duplicate",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::WorkerCrash { .. } => "worker_crash",
            Self::SafetyViolation { .. } => "safety_violation",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::CrashStorm { .. } => "crash_storm",
            Self::Backend(_) => "backend",
            Self::Tool(_) => "tool",
            Self::Config(_) | Self::ConfigParse(_) => "config",
            Self::ChannelClosed => "channel",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether this error must halt new work until someone intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::CrashStorm { .. })
    }
}
