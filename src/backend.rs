//! Interfaces to the collaborators the supervisor drives but does not own:
//! the reasoning backend and version control.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::Result;
use crate::types::{Task, TaskId, TaskKind};

/// Speaker of a context message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool results; matches [`ToolInvocation::id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Conversation state handed to the backend each round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub messages: Vec<Message>,
    /// Tools exposed to this task's kind.
    pub tools: Vec<String>,
}

impl Context {
    pub fn for_task(task: &Task, tools: Vec<String>) -> Self {
        let payload = match &task.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            task_id: task.id,
            kind: task.kind,
            messages: vec![Message::new(Role::User, payload)],
            tools,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Recent conversation as plain text, newest last, for safety review.
    pub fn transcript(&self, max_messages: usize) -> String {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One tool call requested by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Backend reply for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Model that actually served the call (after any client-side fallback).
    pub model: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default)]
    pub cost: Decimal,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Worth retrying (rate limit, connection reset, 5xx)
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend failure: {0}")]
    Fatal(String),
    #[error("backend call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Language-model client
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn call(&self, context: &Context) -> std::result::Result<Response, BackendError>;
}

/// Lifecycle hooks into the agent's version history
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Record the current state; returns an identifier for it.
    async fn snapshot(&self, reason: &str) -> Result<String>;

    async fn rollback(&self, target: &str) -> Result<()>;
}

/// Version control for deployments without a repository
pub struct NoVersionControl;

#[async_trait]
impl VersionControl for NoVersionControl {
    async fn snapshot(&self, _reason: &str) -> Result<String> {
        Ok("none".to_string())
    }

    async fn rollback(&self, target: &str) -> Result<()> {
        Err(crate::error::VigilError::Config(format!(
            "no version control configured, cannot roll back to {target}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskOrigin;
    use serde_json::json;

    #[test]
    fn test_context_starts_with_payload() {
        let task = Task::new(TaskKind::User, json!("list files"), TaskOrigin::Owner).unwrap();
        let mut ctx = Context::for_task(&task, vec!["run_shell".into()]);
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.messages[0].content, "list files");

        ctx.push(Message::new(Role::Assistant, "running ls"));
        ctx.push(Message::tool_result("c1", "a.txt"));
        assert_eq!(ctx.transcript(2), "[Assistant] running ls\n[Tool] a.txt");
    }

    #[test]
    fn test_retryable() {
        assert!(BackendError::Transient("429".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::Fatal("bad key".into()).is_retryable());
    }

    #[test]
    fn test_response_defaults() {
        let r: Response = serde_json::from_str(r#"{"model":"main"}"#).unwrap();
        assert!(r.tool_calls.is_empty());
        assert_eq!(r.cost, Decimal::ZERO);
    }
}
