//! Supervisor loop - the single writer of queue and pool state
//!
//! Each tick, in order:
//!
//! 1. drain the event bus and apply what workers reported;
//! 2. pool health check and timeout enforcement;
//! 3. assignment of pending work to idle workers (or, while draining for a
//!    restart, waiting for running work to finish);
//! 4. queue snapshot, if anything changed;
//! 5. owner commands.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{NoVersionControl, ReasoningBackend, VersionControl};
use crate::channel::{ChannelPair, Command, SupervisorChannel};
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::event::{event_bus, Event, EventReceiver};
use crate::exit_codes;
use crate::journal::Journal;
use crate::ledger::CostLedger;
use crate::pool::{PoolSettings, WorkerPool, WorkerSummary};
use crate::process::ProcessRegistry;
use crate::queue::{Cancelled, TaskQueue};
use crate::safety::{Classifier, SafetyGate};
use crate::settings::{Settings, BUDGET_CEILING, NO_AUTO_RESUME, PAUSED_KINDS};
use crate::snapshot::SnapshotStore;
use crate::tools::ToolRegistry;
use crate::types::{FailureReason, TaskId, TaskKind, TaskOutcome, TaskRequest, WorkerId};
use crate::worker::WorkerDeps;

/// Most events applied per tick; the rest wait for the next one.
const DRAIN_LIMIT: usize = 4_096;

/// Why [`Supervisor::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Command channel closed.
    Stopped,
    /// Graceful restart; the watchdog relaunches.
    Restart,
    /// Emergency stop; the watchdog sweeps and stays down.
    Panic,
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Stopped => exit_codes::OK,
            Self::Restart => exit_codes::RESTART,
            Self::Panic => exit_codes::PANIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Starting,
    Running,
    /// Waiting for running tasks before a restart.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub spent: Decimal,
    pub ceiling: Decimal,
    pub remaining: Decimal,
    /// Share of the ceiling spent, two decimal places.
    pub percent: Decimal,
    pub over_budget: bool,
}

impl BudgetStatus {
    fn from_ledger(ledger: &CostLedger) -> Self {
        let spent = ledger.spent_total();
        let ceiling = ledger.ceiling();
        let percent = if ceiling.is_zero() {
            if spent.is_zero() {
                Decimal::ZERO
            } else {
                Decimal::ONE_HUNDRED
            }
        } else {
            (spent * Decimal::ONE_HUNDRED / ceiling).round_dp(2)
        };
        Self {
            spent,
            ceiling,
            remaining: ledger.remaining(),
            percent,
            over_budget: ledger.over_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub worker_id: WorkerId,
    pub elapsed_ms: u64,
    pub cancelling: bool,
}

/// Point-in-time view published after every tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub mode: Mode,
    pub pending: usize,
    pub running: Vec<RunningTask>,
    pub budget: BudgetStatus,
    pub workers: Vec<WorkerSummary>,
    pub paused: Vec<TaskKind>,
    pub crash_storm: bool,
    pub ticks: u64,
}

/// External pieces the supervisor drives
pub struct Collaborators {
    pub backend: Arc<dyn ReasoningBackend>,
    pub classifier: Arc<dyn Classifier>,
    pub escalation: Option<Arc<dyn Classifier>>,
    pub tools: ToolRegistry,
    pub vcs: Arc<dyn VersionControl>,
    /// Working directory handed to tools.
    pub workdir: PathBuf,
}

impl Collaborators {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        classifier: Arc<dyn Classifier>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            backend,
            classifier,
            escalation: None,
            tools,
            vcs: Arc::new(NoVersionControl),
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_escalation(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.escalation = Some(classifier);
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Everything a worker needs under `config`.
    ///
    /// Used by the supervisor for its own pool and by a worker child, which
    /// passes its private ledger and an observed process registry.
    pub fn into_worker_deps(
        self,
        config: &SupervisorConfig,
        ledger: Arc<CostLedger>,
        processes: Arc<ProcessRegistry>,
    ) -> WorkerDeps {
        let mut tools = self.tools;
        tools.extend_checked(config.safety.checked_tools.iter().cloned());
        tools.set_default_timeout(Duration::from_millis(config.worker.default_tool_timeout_ms));

        let mut gate = SafetyGate::new(self.classifier, Arc::clone(&ledger), &config.safety);
        if let Some(deep) = self.escalation {
            gate = gate.with_escalation(deep);
        }
        WorkerDeps {
            backend: self.backend,
            tools: Arc::new(tools),
            gate: Arc::new(gate),
            ledger,
            processes,
            config: config.worker.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            workdir: self.workdir,
        }
    }
}

struct Drain {
    deadline: Instant,
    reason: String,
    rollback: Option<String>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    queue: TaskQueue,
    pool: WorkerPool,
    bus: EventReceiver,
    fanout: broadcast::Sender<Event>,
    status_tx: watch::Sender<SupervisorStatus>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    ledger: Arc<CostLedger>,
    processes: Arc<ProcessRegistry>,
    settings: Settings,
    snapshots: SnapshotStore,
    journal: Journal,
    vcs: Arc<dyn VersionControl>,
    budget_halted: bool,
    drain: Option<Drain>,
    snapshot_revision: Option<u64>,
    ticks: u64,
}

impl Supervisor {
    /// Build a supervisor over `config.state_dir`, recovering queued work.
    pub fn new(config: SupervisorConfig, collab: Collaborators, channels: ChannelPair) -> Result<Self> {
        config.validate()?;
        let state = config.state_dir.clone();
        fs::create_dir_all(&state)?;

        let settings = Settings::new(state.join("settings.json"));
        let ceiling = settings
            .get::<Decimal>(BUDGET_CEILING)?
            .unwrap_or(config.budget_ceiling);
        let ledger = Arc::new(CostLedger::open(state.join("ledger"), ceiling)?);
        let processes = Arc::new(ProcessRegistry::persistent(state.join("processes.json")));
        let mut journal = Journal::open(state.join("logs"))?;
        let snapshots = SnapshotStore::new(state.join("queue_snapshot.json"));

        let (event_tx, bus) = event_bus(
            config.event_capacity,
            Duration::from_millis(config.backpressure_wait_ms),
        );
        let vcs = Arc::clone(&collab.vcs);
        let deps = collab.into_worker_deps(&config, Arc::clone(&ledger), Arc::clone(&processes));
        let pool = WorkerPool::new(PoolSettings::from_config(&config), deps, event_tx);

        let mut queue = TaskQueue::new();
        for kind in settings.get::<Vec<TaskKind>>(PAUSED_KINDS)?.unwrap_or_default() {
            queue.pause(kind);
        }
        let no_auto_resume = settings.get::<bool>(NO_AUTO_RESUME)?.unwrap_or(false);
        let tasks = snapshots.load().map(|s| s.tasks_to_resume()).unwrap_or_default();
        if no_auto_resume {
            let skipped: Vec<Event> = tasks
                .iter()
                .map(|task| Event::Control {
                    command: "recover".into(),
                    detail: format!("not resuming {} task {} after panic", task.kind, task.id),
                })
                .collect();
            journal.append_all(&skipped);
            journal.flush()?;
            settings.remove(NO_AUTO_RESUME)?;
            warn!(skipped = tasks.len(), "auto-resume disabled, snapshot not replayed");
        } else if !tasks.is_empty() {
            info!(count = tasks.len(), "resuming tasks from snapshot");
            queue.requeue_front(tasks);
        }

        Ok(Self {
            config,
            queue,
            pool,
            bus,
            fanout: channels.events,
            status_tx: channels.status,
            cmd_rx: channels.cmd_rx,
            ledger,
            processes,
            settings,
            snapshots,
            journal,
            vcs,
            budget_halted: false,
            drain: None,
            snapshot_revision: None,
            ticks: 0,
        })
    }

    /// Create a supervisor and return a channel for communication
    pub fn with_channel(config: SupervisorConfig, collab: Collaborators) -> Result<(Self, SupervisorChannel)> {
        let (channel, pair) = SupervisorChannel::new(config.event_capacity);
        Ok((Self::new(config, collab, pair)?, channel))
    }

    pub fn ledger(&self) -> Arc<CostLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn processes(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.processes)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Run the supervisor loop until restart, panic, or the channel closes.
    #[instrument(skip_all, fields(state_dir = %self.config.state_dir.display()))]
    pub async fn run(mut self) -> Result<Shutdown> {
        info!(
            max_workers = self.config.max_workers,
            ceiling = %self.ledger.ceiling(),
            pending = self.queue.pending_len(),
            "supervisor started"
        );
        self.pool.fill();

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = loop {
            ticker.tick().await;
            if let Some(shutdown) = self.tick().await {
                break shutdown;
            }
        };

        self.publish_status(Mode::Stopped);
        self.journal.flush()?;
        if let Err(e) = self.ledger.write_aggregate() {
            warn!(error = %e, "failed to write ledger aggregate");
        }
        info!(?shutdown, exit_code = shutdown.exit_code(), "supervisor stopped");
        Ok(shutdown)
    }

    /// One pass of the loop.
    pub async fn tick(&mut self) -> Option<Shutdown> {
        self.ticks += 1;
        let now = Instant::now();

        for envelope in self.bus.drain_envelopes(DRAIN_LIMIT) {
            self.apply(envelope.event, envelope.origin, now);
        }
        self.check_budget();

        for event in self.pool.health_check(now) {
            self.apply(event, None, now);
        }
        for event in self.pool.enforce_timeouts(&mut self.queue, now) {
            self.apply(event, None, now);
        }

        if let Some(shutdown) = self.assign(now).await {
            return Some(shutdown);
        }

        self.persist_snapshot("periodic");

        loop {
            match self.cmd_rx.try_recv() {
                Ok(command) => {
                    if let Some(shutdown) = self.handle_command(command, now).await {
                        return Some(shutdown);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Some(self.stop().await),
            }
        }

        if let Err(e) = self.journal.flush() {
            warn!(error = %e, "failed to flush event log");
        }
        let mode = if self.drain.is_some() {
            Mode::Draining
        } else {
            Mode::Running
        };
        self.publish_status(mode);
        None
    }

    /// Apply one event. `origin` is the worker that reported it, if any;
    /// task events from a worker that no longer holds the task are dropped.
    fn apply(&mut self, event: Event, origin: Option<WorkerId>, now: Instant) {
        if let Event::Heartbeat { worker_id } = &event {
            self.pool.observe_heartbeat(*worker_id, now);
            return;
        }
        if let (Some(worker_id), Some(task_id)) = (origin, event.task_id()) {
            let holder = self.queue.binding(task_id).map(|b| b.worker_id);
            if holder != Some(worker_id) {
                debug!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    category = event.category(),
                    "event from superseded worker dropped"
                );
                return;
            }
        }
        if let Event::TaskDone { task_id, outcome } = &event {
            match self.queue.complete(*task_id, outcome.clone()) {
                Some(binding) => self.pool.task_finished(binding.worker_id),
                None => {
                    debug!(task_id = %task_id, "completion for task no longer running ignored");
                    return;
                }
            }
        }

        let orphaned = match &event {
            Event::WorkerCrashed {
                task_id: Some(task_id),
                ..
            } => Some(*task_id),
            _ => None,
        };
        self.publish(event);
        if let Some(task_id) = orphaned {
            self.apply(
                Event::TaskDone {
                    task_id,
                    outcome: TaskOutcome::failed(FailureReason::WorkerCrash),
                },
                None,
                now,
            );
        }
    }

    fn publish(&mut self, event: Event) {
        if let Err(e) = self.journal.append(&event) {
            warn!(category = event.category(), error = %e, "failed to journal event");
        }
        // No subscribers is fine.
        let _ = self.fanout.send(event);
    }

    fn control(&mut self, command: &str, detail: impl Into<String>) {
        self.publish(Event::Control {
            command: command.to_string(),
            detail: detail.into(),
        });
    }

    fn check_budget(&mut self) {
        let over = self.ledger.over_budget();
        if over && !self.budget_halted {
            self.budget_halted = true;
            let (spent, ceiling) = (self.ledger.spent_total(), self.ledger.ceiling());
            error!(%spent, %ceiling, "budget exceeded, assignment halted");
            self.publish(Event::BudgetExceeded { spent, ceiling });
        } else if !over && self.budget_halted {
            self.budget_halted = false;
            info!(remaining = %self.ledger.remaining(), "budget available, assignment resumed");
        }
    }

    async fn assign(&mut self, now: Instant) -> Option<Shutdown> {
        if let Some(drain) = &self.drain {
            if self.queue.running_len() == 0 || now >= drain.deadline {
                let drain = self.drain.take()?;
                return self.finish_restart(drain).await;
            }
            return None;
        }
        if self.budget_halted || self.pool.in_crash_storm() || !self.pool.is_accepting() {
            return None;
        }
        if self.queue.pending_len() == 0 {
            return None;
        }
        let idle = self.pool.idle_workers();
        if idle.is_empty() {
            return None;
        }
        for (task, worker_id) in self.queue.assign(&idle) {
            let task_id = task.id;
            match self.pool.dispatch(worker_id, task) {
                Ok(()) => self.publish(Event::TaskStarted { task_id, worker_id }),
                Err(e) => {
                    warn!(task_id = %task_id, worker_id = %worker_id, error = %e, "dispatch failed, task requeued");
                    self.queue.unassign(task_id);
                }
            }
        }
        None
    }

    fn persist_snapshot(&mut self, reason: &str) {
        let revision = self.queue.revision();
        if self.snapshot_revision == Some(revision) {
            return;
        }
        match self.snapshots.save(&self.queue.snapshot(reason)) {
            Ok(()) => self.snapshot_revision = Some(revision),
            Err(e) => warn!(error = %e, "failed to write queue snapshot"),
        }
    }

    fn force_snapshot(&mut self, reason: &str) {
        self.snapshot_revision = None;
        self.persist_snapshot(reason);
    }

    async fn handle_command(&mut self, command: Command, now: Instant) -> Option<Shutdown> {
        let name = command.name();
        debug!(command = name, "handling command");
        match command {
            Command::Enqueue { request, reply } => {
                let result = self.enqueue(request);
                let _ = reply.send(result);
            }
            Command::Cancel { task_id, reply } => {
                let result = self.cancel(task_id, now);
                let _ = reply.send(result);
            }
            Command::TaskState { task_id, reply } => {
                let _ = reply.send(self.queue.state(task_id));
            }
            Command::Restart { reason } => self.start_drain(now, reason, None),
            Command::Rollback { target } => {
                self.start_drain(now, format!("rollback to {target}"), Some(target))
            }
            Command::Panic { reason } => return Some(self.panic(&reason).await),
            Command::PauseKind(kind) => {
                if self.queue.pause(kind) {
                    self.persist_paused();
                }
                self.control(name, kind.as_str());
            }
            Command::ResumeKind(kind) => {
                if self.queue.resume(kind) {
                    self.persist_paused();
                }
                self.control(name, kind.as_str());
            }
            Command::RaiseBudget(ceiling) => {
                if ceiling.is_sign_negative() {
                    warn!(%ceiling, "negative budget ceiling ignored");
                    return None;
                }
                self.ledger.set_ceiling(ceiling);
                if let Err(e) = self.settings.set(BUDGET_CEILING, &ceiling) {
                    warn!(error = %e, "failed to persist budget ceiling");
                }
                self.control(name, format!("ceiling set to {ceiling}"));
                self.check_budget();
            }
            Command::ResetCrashGuard => {
                self.pool.reset_crash_guard();
                self.control(name, "respawning resumed");
            }
        }
        None
    }

    fn enqueue(&mut self, request: TaskRequest) -> Result<TaskId> {
        let task = request.into_task().inspect_err(|e| warn!(error = %e, "task rejected"))?;
        let kind = task.kind;
        let task_id = self.queue.enqueue(task)?;
        self.publish(Event::TaskQueued { task_id, kind });
        Ok(task_id)
    }

    fn cancel(&mut self, task_id: TaskId, now: Instant) -> Result<Cancelled> {
        let cancelled = self
            .queue
            .cancel(task_id, now)
            .inspect_err(|e| warn!(task_id = %task_id, error = %e, "cancel failed"))?;
        match cancelled {
            Cancelled::Removed => self.publish(Event::TaskDone {
                task_id,
                outcome: TaskOutcome::Cancelled,
            }),
            Cancelled::Signal(worker_id) => {
                self.pool.cancel_task(worker_id);
                self.publish(Event::TaskCancelling { task_id, worker_id });
            }
            Cancelled::AlreadyCancelling(_) => {}
        }
        Ok(cancelled)
    }

    fn persist_paused(&self) {
        if let Err(e) = self.settings.set(PAUSED_KINDS, &self.queue.paused()) {
            warn!(error = %e, "failed to persist paused kinds");
        }
    }

    fn start_drain(&mut self, now: Instant, reason: String, rollback: Option<String>) {
        if self.drain.is_some() {
            warn!(%reason, "restart already in progress");
            return;
        }
        let running = self.queue.running_len();
        info!(%reason, running, "draining for restart");
        self.control(
            if rollback.is_some() { "rollback" } else { "restart" },
            format!("{reason}; waiting for {running} running tasks"),
        );
        self.drain = Some(Drain {
            deadline: now + Duration::from_millis(self.config.restart_drain_ms),
            reason,
            rollback,
        });
    }

    async fn finish_restart(&mut self, drain: Drain) -> Option<Shutdown> {
        match &drain.rollback {
            Some(target) => {
                if let Err(e) = self.vcs.rollback(target).await {
                    error!(%target, error = %e, "rollback failed, restart aborted");
                    self.control("rollback", format!("rollback to {target} failed: {e}; restart aborted"));
                    return None;
                }
                info!(%target, "rolled back");
            }
            None => match self.vcs.snapshot(&drain.reason).await {
                Ok(id) => info!(snapshot = %id, "version snapshot taken"),
                Err(e) => warn!(error = %e, "version snapshot failed, restarting anyway"),
            },
        }

        if self.queue.running_len() > 0 {
            warn!(running = self.queue.running_len(), "drain deadline passed, running tasks will resume after restart");
        }
        self.force_snapshot("restart");
        self.pool.shutdown(false).await;
        self.control("restart", format!("{}; exiting for relaunch", drain.reason));
        Some(Shutdown::Restart)
    }

    async fn panic(&mut self, reason: &str) -> Shutdown {
        error!(%reason, "panic: stopping everything");
        for kind in TaskKind::ALL {
            self.queue.pause(kind);
        }
        let paused = self.queue.paused();
        if let Err(e) = self.settings.update(|map| {
            map.insert(PAUSED_KINDS.to_string(), json!(paused));
            map.insert(NO_AUTO_RESUME.to_string(), json!(true));
        }) {
            error!(error = %e, "failed to persist panic flags");
        }

        let killed = self.processes.kill_all();
        self.pool.shutdown(true).await;
        self.force_snapshot("panic");
        self.control("panic", format!("{reason}; killed {killed} process groups"));
        Shutdown::Panic
    }

    async fn stop(&mut self) -> Shutdown {
        info!("command channel closed, stopping");
        self.force_snapshot("stop");
        self.pool.shutdown(false).await;
        Shutdown::Stopped
    }

    pub fn status(&self, mode: Mode) -> SupervisorStatus {
        let now = Instant::now();
        let mut running: Vec<RunningTask> = self
            .queue
            .running()
            .map(|b| RunningTask {
                task_id: b.task.id,
                kind: b.task.kind,
                worker_id: b.worker_id,
                elapsed_ms: now.saturating_duration_since(b.started).as_millis() as u64,
                cancelling: b.cancel_requested.is_some(),
            })
            .collect();
        running.sort_by_key(|r| std::cmp::Reverse(r.elapsed_ms));
        SupervisorStatus {
            mode,
            pending: self.queue.pending_len(),
            running,
            budget: BudgetStatus::from_ledger(&self.ledger),
            workers: self.pool.summaries(now),
            paused: self.queue.paused(),
            crash_storm: self.pool.in_crash_storm(),
            ticks: self.ticks,
        }
    }

    fn publish_status(&self, mode: Mode) {
        self.status_tx.send_replace(self.status(mode));
    }
}
