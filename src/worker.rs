//! Worker - runs one task at a time in an isolated execution context
//!
//! A worker owns a dedicated OS thread with its own single-threaded tokio
//! runtime. The supervisor talks to it through a command channel (task in)
//! and the shared event bus (events out); the only shared state is the cost
//! ledger and the process registry, both internally locked.
//!
//! In process isolation the same worker runs inside a child process and
//! [`crate::isolation`] stands in for the thread on the supervisor side.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendError, Context, Message, ReasoningBackend, Response, Role, ToolInvocation};
use crate::config::WorkerConfig;
use crate::event::{digest, Event, EventSender};
use crate::ledger::CostLedger;
use crate::process::ProcessRegistry;
use crate::safety::{Clearance, ProposedAction, SafetyGate};
use crate::tools::{ToolContext, ToolError, ToolRegistry};
use crate::types::{truncate_chars, CostCategory, FailureReason, Task, TaskOutcome, Verdict, WorkerId};

const RETRY_BASE: Duration = Duration::from_millis(250);
const SUMMARY_CHARS: usize = 500;
/// Messages of recent context shown to the safety classifiers.
const REVIEW_WINDOW: usize = 8;

/// Everything a worker needs, shared by all workers in a pool
#[derive(Clone)]
pub struct WorkerDeps {
    pub backend: Arc<dyn ReasoningBackend>,
    pub tools: Arc<ToolRegistry>,
    pub gate: Arc<SafetyGate>,
    pub ledger: Arc<CostLedger>,
    pub processes: Arc<ProcessRegistry>,
    pub config: WorkerConfig,
    pub heartbeat_interval: Duration,
    /// Working directory for tools.
    pub workdir: PathBuf,
}

pub(crate) enum WorkerCommand {
    Run { task: Task, cancel: CancellationToken },
    Stop,
}

/// Supervisor-side ends of a running worker thread
pub(crate) struct WorkerThread {
    pub join: JoinHandle<()>,
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub kill: CancellationToken,
}

/// A single worker
pub struct Worker {
    id: WorkerId,
    deps: WorkerDeps,
    events: EventSender,
}

impl Worker {
    pub fn new(id: WorkerId, deps: WorkerDeps, events: EventSender) -> Self {
        Self { id, deps, events }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Move the worker onto its own thread and runtime.
    pub(crate) fn spawn(self, stack_size: usize) -> io::Result<WorkerThread> {
        let (tx, rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let killed = kill.clone();
        let id = self.id;

        let join = std::thread::Builder::new()
            .name(format!("vigil-{id}"))
            .stack_size(stack_size)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker_id = %id, error = %e, "failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    tokio::select! {
                        biased;
                        _ = killed.cancelled() => debug!(worker_id = %id, "worker killed"),
                        _ = self.serve(rx) => debug!(worker_id = %id, "worker stopped"),
                    }
                });
                runtime.shutdown_background();
            })?;

        info!(worker_id = %id, "worker spawned");
        Ok(WorkerThread {
            join,
            commands: tx,
            kill,
        })
    }

    pub(crate) async fn serve(&self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        self.heartbeat().await;
        let period = self.deps.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Run { task, cancel }) => {
                        let outcome = self.execute(&task, &cancel).await;
                        self.emit(Event::TaskDone { task_id: task.id, outcome }).await;
                    }
                    Some(WorkerCommand::Stop) | None => break,
                },
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
    }

    /// Run `task` to a terminal outcome.
    ///
    /// Cancellation is checked between rounds and before each tool call. A
    /// task whose spend crossed the ledger ceiling stops before its next round.
    #[instrument(skip_all, fields(worker_id = %self.id, task_id = %task.id, kind = %task.kind))]
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskOutcome {
        info!("task started");
        self.emit(Event::Progress {
            task_id: task.id,
            text: format!("started {} task: {}", task.kind, task.summary(120)),
        })
        .await;

        let mut ctx = Context::for_task(task, self.deps.tools.names_for(task.kind));
        for round in 1..=self.deps.config.max_rounds {
            if cancel.is_cancelled() {
                info!(round, "task cancelled");
                return TaskOutcome::Cancelled;
            }
            if round > 1 && self.deps.ledger.over_budget() {
                warn!(round, spent = %self.deps.ledger.spent_total(), "budget exceeded, stopping task");
                return TaskOutcome::failed(FailureReason::Budget);
            }

            let response = match self.call_backend(&ctx).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(round, error = %e, "backend call failed");
                    return TaskOutcome::failed(FailureReason::Backend(e.to_string()));
                }
            };
            self.record_cost(task, &response).await;

            if !response.text.trim().is_empty() {
                self.emit(Event::Progress {
                    task_id: task.id,
                    text: truncate_chars(&response.text, SUMMARY_CHARS),
                })
                .await;
            }
            ctx.push(Message::new(Role::Assistant, response.text.clone()));

            if response.tool_calls.is_empty() {
                info!(round, "task finished");
                return TaskOutcome::Success {
                    summary: truncate_chars(&response.text, SUMMARY_CHARS),
                };
            }

            let Some(results) = self.run_tools(task, &ctx, &response.tool_calls, cancel).await else {
                info!(round, "task cancelled before tool call");
                return TaskOutcome::Cancelled;
            };
            for (call_id, result) in results {
                ctx.push(Message::tool_result(call_id, result));
            }
        }

        warn!(max_rounds = self.deps.config.max_rounds, "round limit reached");
        TaskOutcome::failed(FailureReason::RoundLimit)
    }

    async fn call_backend(&self, ctx: &Context) -> Result<Response, BackendError> {
        let limit = Duration::from_millis(self.deps.config.call_timeout_ms);
        let mut attempt = 0u32;
        loop {
            let call = self.with_heartbeat(self.deps.backend.call(ctx));
            let result = match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(limit)),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.deps.config.backend_retries => {
                    let backoff = RETRY_BASE * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying backend call");
                    self.with_heartbeat(tokio::time::sleep(backoff)).await;
                }
                other => return other,
            }
        }
    }

    async fn record_cost(&self, task: &Task, response: &Response) {
        if response.cost.is_zero() {
            return;
        }
        match self
            .deps
            .ledger
            .record(&response.model, CostCategory::Task, response.cost, Some(task.id))
        {
            Ok(_) => {
                self.emit(Event::CostEntry {
                    task_id: Some(task.id),
                    model: response.model.clone(),
                    category: CostCategory::Task,
                    amount: response.cost,
                })
                .await
            }
            Err(e) => error!(error = %e, "failed to record task cost"),
        }
    }

    /// Run one round of tool calls, returning `(call_id, result)` in call order.
    ///
    /// Consecutive read-only calls run concurrently; gated calls run one at a
    /// time. `None` means the task was cancelled at a checkpoint.
    async fn run_tools(
        &self,
        task: &Task,
        ctx: &Context,
        calls: &[ToolInvocation],
        cancel: &CancellationToken,
    ) -> Option<Vec<(String, String)>> {
        let mut results = Vec::with_capacity(calls.len());
        let mut batch: Vec<&ToolInvocation> = Vec::new();

        for call in calls {
            if !self.deps.tools.requires_gate(&call.name) {
                batch.push(call);
                continue;
            }
            if !batch.is_empty() {
                results.extend(self.run_read_only(task, &batch, cancel).await?);
                batch.clear();
            }
            if cancel.is_cancelled() {
                return None;
            }
            let result = self.run_gated(task, ctx, call, cancel).await;
            results.push((call.id.clone(), result));
        }
        if !batch.is_empty() {
            results.extend(self.run_read_only(task, &batch, cancel).await?);
        }
        Some(results)
    }

    async fn run_read_only(
        &self,
        task: &Task,
        batch: &[&ToolInvocation],
        cancel: &CancellationToken,
    ) -> Option<Vec<(String, String)>> {
        if cancel.is_cancelled() {
            return None;
        }
        let runs = batch.iter().map(|call| async move {
            let result = self.invoke(task, call, None, cancel).await;
            (call.id.clone(), result)
        });
        Some(self.with_heartbeat(join_all(runs)).await)
    }

    async fn run_gated(
        &self,
        task: &Task,
        ctx: &Context,
        call: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> String {
        if !self.deps.tools.exposed_to(&call.name, task.kind) {
            return unavailable(&call.name, task);
        }
        let action = ProposedAction::new(&call.name, call.args.clone());
        let gate = &self.deps.gate;
        let decision = self
            .with_heartbeat(gate.evaluate(Some(task.id), &ctx.transcript(REVIEW_WINDOW), &action))
            .await;

        for charge in &decision.charges {
            self.emit(Event::CostEntry {
                task_id: Some(task.id),
                model: charge.model.clone(),
                category: CostCategory::Model,
                amount: charge.amount,
            })
            .await;
        }
        self.emit(Event::SafetyVerdict {
            task_id: task.id,
            tool: call.name.clone(),
            verdict: decision.verdict,
            reasoning: decision.reasoning.clone(),
        })
        .await;

        match gate.clear(&decision, &action) {
            Some(clearance) => {
                let result = self
                    .with_heartbeat(self.invoke(task, call, Some(&clearance), cancel))
                    .await;
                if decision.verdict == Verdict::Suspicious {
                    format!("SAFETY_WARNING: {}\n{result}", decision.reasoning)
                } else {
                    result
                }
            }
            None if decision.verdict == Verdict::Dangerous => {
                warn!(tool = %call.name, reasoning = %decision.reasoning, "action blocked");
                format!("SAFETY_VIOLATION: {}", decision.reasoning)
            }
            None => {
                info!(tool = %call.name, "suspicious action held for confirmation");
                format!(
                    "SAFETY_REVIEW: action held as SUSPICIOUS ({}). Revise it, or re-issue it with a justification.",
                    decision.reasoning
                )
            }
        }
    }

    async fn invoke(
        &self,
        task: &Task,
        call: &ToolInvocation,
        clearance: Option<&Clearance>,
        cancel: &CancellationToken,
    ) -> String {
        if !self.deps.tools.exposed_to(&call.name, task.kind) {
            return unavailable(&call.name, task);
        }
        let tool_ctx = ToolContext {
            task_id: task.id,
            workdir: self.deps.workdir.clone(),
            processes: self.deps.processes.scope(self.id),
            cancel: cancel.clone(),
        };
        let outcome = self
            .deps
            .tools
            .invoke(&call.name, call.args.clone(), &tool_ctx, clearance)
            .await;
        let result = match outcome {
            Ok(text) => text,
            Err(e @ ToolError::Timeout { .. }) => {
                warn!(tool = %call.name, error = %e, "tool timed out");
                format!("TOOL_TIMEOUT: {e}")
            }
            Err(e) => {
                debug!(tool = %call.name, error = %e, "tool failed");
                format!("ERROR: {e}")
            }
        };
        self.emit(Event::ToolCall {
            task_id: task.id,
            tool: call.name.clone(),
            args_digest: digest(&call.args.to_string()),
            result_digest: digest(&result),
        })
        .await;
        result
    }

    /// Await `fut`, reporting liveness while it runs.
    async fn with_heartbeat<F: Future>(&self, fut: F) -> F::Output {
        let period = self.deps.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
    }

    async fn heartbeat(&self) {
        self.emit(Event::Heartbeat { worker_id: self.id }).await;
    }

    async fn emit(&self, event: Event) {
        // Closed only when the supervisor is gone; nothing left to tell.
        let _ = self.events.emit(event).await;
    }
}

fn unavailable(tool: &str, task: &Task) -> String {
    format!("ERROR: tool {tool} is not available to {} tasks", task.kind)
}
