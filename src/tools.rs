//! Tool registry
//!
//! Tools are registered explicitly with a capability. Mutating tools (and
//! any tool named in the checked set) can only be invoked with a
//! [`Clearance`] issued by the safety gate.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::ProcessScope;
use crate::safety::Clearance;
use crate::types::{truncate_chars, TaskId, TaskKind};

/// What a tool may do to the world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    Mutating,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{tool} timed out after {}ms", .after.as_millis())]
    Timeout { tool: String, after: Duration },
    #[error("{0} requires a safety clearance")]
    Ungated(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-call environment handed to a tool
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub workdir: PathBuf,
    pub processes: ProcessScope,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Overrides the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError>;
}

struct Entry {
    tool: Arc<dyn Tool>,
    /// `None` exposes the tool to every kind.
    kinds: Option<Vec<TaskKind>>,
}

/// Explicit registry of capability-typed tools
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
    checked: HashSet<String>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            checked: HashSet::new(),
            default_timeout,
        }
    }

    /// Names gated regardless of their declared capability.
    pub fn with_checked(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.checked.extend(names);
        self
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    pub fn extend_checked(&mut self, names: impl IntoIterator<Item = String>) {
        self.checked.extend(names);
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.insert(tool, None);
    }

    /// Register a tool visible only to the given kinds.
    pub fn register_for(&mut self, tool: Arc<dyn Tool>, kinds: &[TaskKind]) {
        self.insert(tool, Some(kinds.to_vec()));
    }

    fn insert(&mut self, tool: Arc<dyn Tool>, kinds: Option<Vec<TaskKind>>) {
        let name = tool.name().to_string();
        debug!(tool = %name, capability = ?tool.capability(), "tool registered");
        self.tools.insert(name, Entry { tool, kinds });
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names_for(&self, kind: TaskKind) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, e)| e.kinds.as_ref().map_or(true, |k| k.contains(&kind)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn exposed_to(&self, name: &str, kind: TaskKind) -> bool {
        self.tools
            .get(name)
            .is_some_and(|e| e.kinds.as_ref().map_or(true, |k| k.contains(&kind)))
    }

    /// Whether a call to `name` must pass the safety gate first.
    ///
    /// Unknown names are treated as gated.
    pub fn requires_gate(&self, name: &str) -> bool {
        if self.checked.contains(name) {
            return true;
        }
        self.tools
            .get(name)
            .map_or(true, |e| e.tool.capability() == Capability::Mutating)
    }

    pub fn timeout_for(&self, name: &str) -> Duration {
        self.tools
            .get(name)
            .and_then(|e| e.tool.timeout())
            .unwrap_or(self.default_timeout)
    }

    /// Invoke a tool under its timeout.
    ///
    /// Gated tools need a clearance issued for exactly this name and these args.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        clearance: Option<&Clearance>,
    ) -> Result<String, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        if self.requires_gate(name) && !clearance.is_some_and(|c| c.covers(name, &args)) {
            return Err(ToolError::Ungated(name.to_string()));
        }
        let after = self.timeout_for(name);
        match tokio::time::timeout(after, entry.tool.invoke(args, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_string(),
                after,
            }),
        }
    }
}

/// `run_shell`: runs `args.cmd` through `sh -c` in the task's workdir.
pub struct ShellTool {
    timeout: Option<Duration>,
}

impl ShellTool {
    pub const NAME: &'static str = "run_shell";
    const MAX_OUTPUT: usize = 16_000;

    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capability(&self) -> Capability {
        Capability::Mutating
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let cmd = args
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArgs("expected {\"cmd\": string}".into()))?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(&ctx.workdir);
        let output = ctx.processes.output(command).await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&stderr);
        }
        if !output.status.success() {
            text.push_str(&format!("\n(exit status: {})", output.status));
        }
        Ok(truncate_chars(&text, Self::MAX_OUTPUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use crate::testing::EchoTool;
    use serde_json::json;

    fn ctx(dir: PathBuf) -> ToolContext {
        let registry = Arc::new(ProcessRegistry::in_memory());
        ToolContext {
            task_id: TaskId::new(),
            workdir: dir,
            processes: registry.scope(crate::types::WorkerId(1)),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_exposure_by_kind() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(EchoTool::read_only("read_file")));
        registry.register_for(Arc::new(ShellTool::new()), &[TaskKind::User]);

        assert_eq!(registry.names_for(TaskKind::User), vec!["read_file", "run_shell"]);
        assert_eq!(registry.names_for(TaskKind::Review), vec!["read_file"]);
        assert!(!registry.exposed_to("run_shell", TaskKind::Evolution));
    }

    #[test]
    fn test_gating_rules() {
        let mut registry = ToolRegistry::new(Duration::from_secs(1))
            .with_checked(vec!["drive_write".to_string()]);
        registry.register(Arc::new(EchoTool::read_only("read_file")));
        registry.register(Arc::new(EchoTool::read_only("drive_write")));
        registry.register(Arc::new(ShellTool::new()));

        assert!(!registry.requires_gate("read_file"));
        assert!(registry.requires_gate("drive_write"));
        assert!(registry.requires_gate("run_shell"));
        assert!(registry.requires_gate("never_registered"));
    }

    #[tokio::test]
    async fn test_mutating_tool_refused_without_clearance() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(ShellTool::new()));

        let err = registry
            .invoke("run_shell", json!({"cmd": "echo hi"}), &ctx(temp.path().into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Ungated(_)));
    }

    #[tokio::test]
    async fn test_clearance_must_match_args() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(ShellTool::new()));
        let cleared = Clearance::issue("run_shell", &json!({"cmd": "echo hi"}));

        let out = registry
            .invoke("run_shell", json!({"cmd": "echo hi"}), &ctx(temp.path().into()), Some(&cleared))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hi");

        let err = registry
            .invoke("run_shell", json!({"cmd": "rm -rf ."}), &ctx(temp.path().into()), Some(&cleared))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Ungated(_)));
    }

    #[tokio::test]
    async fn test_tool_timeout() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new(Duration::from_secs(30));
        registry.register(Arc::new(ShellTool::with_timeout(Duration::from_millis(100))));
        let args = json!({"cmd": "sleep 5"});
        let cleared = Clearance::issue("run_shell", &args);

        let started = std::time::Instant::now();
        let err = registry
            .invoke("run_shell", args, &ctx(temp.path().into()), Some(&cleared))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_shell_reports_failure_status() {
        let temp = tempfile::tempdir().unwrap();
        let tool = ShellTool::new();
        let out = tool
            .invoke(json!({"cmd": "echo oops >&2; exit 3"}), &ctx(temp.path().into()))
            .await
            .unwrap();
        assert!(out.contains("oops"));
        assert!(out.contains("exit status"));

        let err = tool.invoke(json!({}), &ctx(temp.path().into())).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}
