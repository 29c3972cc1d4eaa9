//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::backend::{BackendError, Context, ReasoningBackend, Response, ToolInvocation, VersionControl};
use crate::error::Result;
use crate::safety::{Assessment, Classifier, ProposedAction};
use crate::tools::{Capability, Tool, ToolContext, ToolError};
use crate::types::Verdict;

pub fn reply(text: &str) -> Response {
    Response {
        model: "main".into(),
        text: text.into(),
        tool_calls: Vec::new(),
        cost: Decimal::ZERO,
    }
}

pub fn calls(calls: &[(&str, Value)]) -> Response {
    Response {
        model: "main".into(),
        text: String::new(),
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolInvocation {
                id: format!("call-{i}"),
                name: name.to_string(),
                args: args.clone(),
            })
            .collect(),
        cost: Decimal::ZERO,
    }
}

pub fn shell(cmd: &str) -> Response {
    calls(&[("run_shell", json!({ "cmd": cmd }))])
}

/// Backend that replays a fixed script, then answers "done".
pub struct ScriptedBackend {
    script: Mutex<VecDeque<std::result::Result<Response, BackendError>>>,
    seen: Arc<Mutex<Vec<Context>>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<std::result::Result<Response, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    pub fn replies(script: Vec<Response>) -> Self {
        Self::new(script.into_iter().map(Ok).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every context the backend was called with.
    pub fn seen(&self) -> Arc<Mutex<Vec<Context>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn call(&self, context: &Context) -> std::result::Result<Response, BackendError> {
        self.seen.lock().push(context.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(reply("done")))
    }
}

/// Classifier with a default verdict and substring rules.
pub struct ScriptedClassifier {
    default: Option<Verdict>,
    rules: Vec<(String, Verdict)>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedClassifier {
    pub fn verdict(verdict: Verdict) -> Self {
        Self {
            default: Some(verdict),
            rules: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            default: None,
            rules: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn when(mut self, needle: &str, verdict: Verdict) -> Self {
        self.rules.push((needle.to_string(), verdict));
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _context: &str,
        action: &ProposedAction,
    ) -> std::result::Result<Assessment, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let described = action.describe();
        let verdict = self
            .rules
            .iter()
            .find(|(needle, _)| described.contains(needle.as_str()))
            .map(|(_, v)| *v)
            .or(self.default)
            .ok_or_else(|| BackendError::Transient("classifier offline".into()))?;
        Ok(Assessment {
            verdict,
            reasoning: format!("scripted {verdict}"),
            model: "light".into(),
            cost: Decimal::new(1, 3),
        })
    }
}

/// Tool that echoes its arguments, tracking peak concurrency.
pub struct EchoTool {
    name: String,
    capability: Capability,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl EchoTool {
    fn new(name: &str, capability: Capability) -> Self {
        Self {
            name: name.to_string(),
            capability,
            delay: None,
            in_flight: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn read_only(name: &str) -> Self {
        Self::new(name, Capability::ReadOnly)
    }

    pub fn mutating(name: &str) -> Self {
        Self::new(name, Capability::Mutating)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn peak(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> std::result::Result<String, ToolError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("echo: {args}"))
    }
}

/// Version control that records what it was asked to do.
#[derive(Default)]
pub struct RecordingVcs {
    pub snapshots: Mutex<Vec<String>>,
    pub rollbacks: Mutex<Vec<String>>,
}

#[async_trait]
impl VersionControl for RecordingVcs {
    async fn snapshot(&self, reason: &str) -> Result<String> {
        let mut snapshots = self.snapshots.lock();
        snapshots.push(reason.to_string());
        Ok(format!("snap-{}", snapshots.len()))
    }

    async fn rollback(&self, target: &str) -> Result<()> {
        self.rollbacks.lock().push(target.to_string());
        Ok(())
    }
}
