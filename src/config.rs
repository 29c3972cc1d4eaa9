//! Supervisor configuration, stored as TOML.
//!
//! Every field has a default so a missing or partial file still yields a
//! working supervisor. Durations are expressed in milliseconds.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VigilError};
use crate::types::TaskKind;

/// Top-level supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Directory holding snapshots, ledger, logs and settings.
    pub state_dir: PathBuf,
    /// Worker slots kept populated.
    pub max_workers: usize,
    /// Spend ceiling in dollars; new work is refused once reached.
    pub budget_ceiling: Decimal,
    pub tick_interval_ms: u64,
    /// How often an idle or busy worker reports liveness.
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this marks a worker dead.
    pub health_grace_ms: u64,
    pub crash_storm: CrashStormConfig,
    pub event_capacity: usize,
    /// Bounded wait before a producer retries a full event channel.
    pub backpressure_wait_ms: u64,
    /// Time a worker gets to honour a cancel before it is killed.
    pub cancel_grace_ms: u64,
    /// Longest a graceful restart waits for running tasks.
    pub restart_drain_ms: u64,
    pub timeouts: TimeoutConfig,
    pub worker: WorkerConfig,
    pub isolation: IsolationConfig,
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrashStormConfig {
    /// More crashes than this inside the window trips the guard.
    pub max_crashes: usize,
    pub window_ms: u64,
}

impl Default for CrashStormConfig {
    fn default() -> Self {
        Self {
            max_crashes: 5,
            window_ms: 120_000,
        }
    }
}

/// Soft/hard limits for one task kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub soft_ms: u64,
    pub hard_ms: u64,
}

impl TimeoutPolicy {
    pub fn soft(&self) -> Duration {
        Duration::from_millis(self.soft_ms)
    }

    pub fn hard(&self) -> Duration {
        Duration::from_millis(self.hard_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default: TimeoutPolicy,
    /// Overrides keyed by task kind.
    pub per_kind: HashMap<TaskKind, TimeoutPolicy>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: TimeoutPolicy {
                soft_ms: 600_000,
                hard_ms: 1_800_000,
            },
            per_kind: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: TaskKind) -> TimeoutPolicy {
        self.per_kind.get(&kind).copied().unwrap_or(self.default)
    }
}

/// Knobs for the per-task reasoning loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_rounds: u32,
    /// Hard limit on a single backend call.
    pub call_timeout_ms: u64,
    /// Extra attempts after a failed backend call.
    pub backend_retries: u32,
    pub default_tool_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 50,
            call_timeout_ms: 300_000,
            backend_retries: 2,
            default_tool_timeout_ms: 120_000,
        }
    }
}

/// Where a worker runs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Dedicated thread and runtime inside the supervisor process.
    #[default]
    Thread,
    /// Child process in its own process group, spoken to over stdio.
    Process,
}

/// Execution context and resource caps for workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsolationConfig {
    pub mode: IsolationMode,
    /// Stack size of each worker thread.
    pub thread_stack_kb: usize,
    /// Program and arguments that start one worker child (process mode).
    pub worker_command: Vec<String>,
    /// Address-space limit for worker children; 0 leaves it unset.
    pub memory_limit_mb: u64,
    /// CPU-time limit for worker children; 0 leaves it unset.
    pub cpu_limit_secs: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: IsolationMode::default(),
            thread_stack_kb: 8 * 1024,
            worker_command: Vec::new(),
            memory_limit_mb: 0,
            cpu_limit_secs: 0,
        }
    }
}

impl IsolationConfig {
    pub fn thread_stack_bytes(&self) -> usize {
        self.thread_stack_kb * 1024
    }
}

/// What to do with a SUSPICIOUS verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousPolicy {
    /// Run the action and hand the warning back to the worker.
    #[default]
    WarnThenProceed,
    /// Hold the action; the worker must confirm or revise.
    BlockThenConfirm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    pub suspicious_policy: SuspiciousPolicy,
    /// Re-evaluate non-SAFE fast verdicts with the stronger classifier.
    pub escalate: bool,
    /// Added to the built-in protected resources; cannot remove any.
    pub extra_protected: Vec<String>,
    /// Tool names gated even if registered as read-only.
    pub checked_tools: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            suspicious_policy: SuspiciousPolicy::default(),
            escalate: true,
            extra_protected: Vec::new(),
            checked_tools: [
                "run_shell",
                "claude_code_edit",
                "repo_write_commit",
                "repo_commit",
                "drive_write",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".vigil"),
            max_workers: 5,
            budget_ceiling: Decimal::from(10),
            tick_interval_ms: 500,
            heartbeat_interval_ms: 1_000,
            health_grace_ms: 30_000,
            crash_storm: CrashStormConfig::default(),
            event_capacity: 1024,
            backpressure_wait_ms: 50,
            cancel_grace_ms: 10_000,
            restart_drain_ms: 30_000,
            timeouts: TimeoutConfig::default(),
            worker: WorkerConfig::default(),
            isolation: IsolationConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_millis(self.health_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(VigilError::Config("max_workers must be > 0".into()));
        }
        if self.budget_ceiling.is_sign_negative() {
            return Err(VigilError::Config("budget_ceiling must not be negative".into()));
        }
        if self.tick_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(VigilError::Config(
                "tick_interval_ms and heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.health_grace_ms <= self.heartbeat_interval_ms {
            return Err(VigilError::Config(
                "health_grace_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(VigilError::Config("event_capacity must be > 0".into()));
        }
        if self.isolation.thread_stack_kb < 64 {
            return Err(VigilError::Config("isolation.thread_stack_kb must be >= 64".into()));
        }
        if self.isolation.mode == IsolationMode::Process && self.isolation.worker_command.is_empty() {
            return Err(VigilError::Config(
                "isolation.worker_command is required in process mode".into(),
            ));
        }
        if self.worker.max_rounds == 0 {
            return Err(VigilError::Config("worker.max_rounds must be > 0".into()));
        }
        let policies = std::iter::once((None, &self.timeouts.default))
            .chain(self.timeouts.per_kind.iter().map(|(k, p)| (Some(k), p)));
        for (kind, policy) in policies {
            if policy.hard_ms == 0 || policy.soft_ms > policy.hard_ms {
                let scope = kind.map(|k| k.to_string()).unwrap_or_else(|| "default".into());
                return Err(VigilError::Config(format!(
                    "timeouts.{scope}: need 0 < soft_ms <= hard_ms"
                )));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path)?;
    let cfg: SupervisorConfig = toml::from_str(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
