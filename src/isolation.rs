//! Process isolation - workers as child processes
//!
//! In process mode each worker is a child process, leader of its own process
//! group, started from `isolation.worker_command`. The supervisor keeps a
//! bridge thread per child that translates pool commands into JSON lines on
//! the child's stdin and relays the JSON lines it prints on stdout back onto
//! the event bus. A child that wedges, aborts or runs out of memory takes
//! only itself down: its heartbeats stop or its stdout closes, and the pool
//! kills the group and replaces it.
//!
//! The child runs an ordinary [`Worker`] against a private ledger whose
//! ceiling is the supervisor's remaining budget at dispatch. Every cost it
//! reports is recorded again in the supervisor's ledger, which stays the
//! only one persisted. Process groups started by the child's tools are
//! reported the same way and tracked in the supervisor's registry.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::resource::{setrlimit, Resource};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IsolationConfig;
use crate::error::{Result, VigilError};
use crate::event::{event_bus, Event, EventSender};
use crate::ledger::CostLedger;
use crate::process::ProcessRegistry;
use crate::types::{Task, TaskId, WorkerId};
use crate::worker::{Worker, WorkerCommand, WorkerDeps, WorkerThread};

/// Environment variable carrying the worker id into the child.
pub const WORKER_ID_ENV: &str = "VIGIL_WORKER_ID";

/// How long a stopping child gets to exit after closing its stdout.
const EXIT_WAIT: Duration = Duration::from_secs(2);
const CHILD_EVENT_CAPACITY: usize = 256;

/// Supervisor → child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToWorker {
    Run { task: Task, budget_remaining: Decimal },
    Cancel { task_id: TaskId },
    /// Spend crossed the ceiling; stop after the current step.
    OverBudget,
    Stop,
}

/// Child → supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FromWorker {
    Event { event: Event },
    /// A process group the child started (`live`) or released.
    Group { pgid: i32, live: bool },
}

/// Start worker `id` as a child process and a bridge thread to drive it.
pub(crate) fn spawn_child(
    id: WorkerId,
    isolation: &IsolationConfig,
    deps: &WorkerDeps,
    events: EventSender,
) -> io::Result<WorkerThread> {
    let (program, args) = isolation
        .worker_command
        .split_first()
        .ok_or_else(|| io::Error::other("isolation.worker_command is empty"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env(WORKER_ID_ENV, id.0.to_string())
        .current_dir(&deps.workdir)
        .process_group(0)
        .kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    let limits = Limits::from_config(isolation);
    if !limits.is_empty() {
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || limits.apply());
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let killed = kill.clone();
    let bridge = Bridge {
        id,
        ledger: Arc::clone(&deps.ledger),
        processes: Arc::clone(&deps.processes),
        events,
    };
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

    let join = std::thread::Builder::new()
        .name(format!("vigil-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let started = {
                let _entered = runtime.enter();
                cmd.spawn()
            };
            let child = match started {
                Ok(child) => child,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let Some(pid) = child.id() else {
                let _ = ready_tx.send(Err(io::Error::other("worker process exited before it could be tracked")));
                return;
            };
            let pgid = pid as i32;
            bridge.processes.register(id, pgid);
            let _ = ready_tx.send(Ok(pgid));
            runtime.block_on(bridge.run(child, pgid, rx, killed));
            runtime.shutdown_background();
        })?;

    let pgid = ready_rx
        .recv()
        .map_err(|_| io::Error::other("worker bridge thread died during startup"))??;
    info!(worker_id = %id, pid = pgid, "worker process spawned");
    Ok(WorkerThread {
        join,
        commands: tx,
        kill,
    })
}

/// Resource caps applied to a worker child before it execs
#[derive(Debug, Clone, Copy, Default)]
struct Limits {
    address_space: Option<u64>,
    cpu_secs: Option<u64>,
}

impl Limits {
    fn from_config(isolation: &IsolationConfig) -> Self {
        Self {
            address_space: (isolation.memory_limit_mb > 0)
                .then(|| isolation.memory_limit_mb * 1024 * 1024),
            cpu_secs: (isolation.cpu_limit_secs > 0).then_some(isolation.cpu_limit_secs),
        }
    }

    fn is_empty(&self) -> bool {
        self.address_space.is_none() && self.cpu_secs.is_none()
    }

    fn apply(&self) -> io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(secs) = self.cpu_secs {
            // SIGXCPU at the soft limit, SIGKILL one second later.
            setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        Ok(())
    }
}

struct Running {
    task_id: TaskId,
    cancel: CancellationToken,
    cancel_sent: bool,
    budget_sent: bool,
}

/// Supervisor side of one worker child
struct Bridge {
    id: WorkerId,
    ledger: Arc<CostLedger>,
    processes: Arc<ProcessRegistry>,
    events: EventSender,
}

impl Bridge {
    async fn run(
        self,
        mut child: Child,
        pgid: i32,
        mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
        killed: CancellationToken,
    ) {
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            error!(worker_id = %self.id, "worker process has no stdio");
            self.processes.unregister(self.id, pgid);
            return;
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut running: Option<Running> = None;
        let mut stopping = false;

        loop {
            let pending_cancel = running
                .as_ref()
                .filter(|r| !r.cancel_sent)
                .map(|r| r.cancel.clone());
            let cancelled = async move {
                match pending_cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = killed.cancelled() => {
                    debug!(worker_id = %self.id, "worker process killed");
                    break;
                }
                command = commands.recv(), if !stopping => {
                    let message = match command {
                        Some(WorkerCommand::Run { task, cancel }) => {
                            running = Some(Running {
                                task_id: task.id,
                                cancel,
                                cancel_sent: false,
                                budget_sent: false,
                            });
                            ToWorker::Run { task, budget_remaining: self.ledger.remaining() }
                        }
                        Some(WorkerCommand::Stop) | None => {
                            stopping = true;
                            ToWorker::Stop
                        }
                    };
                    if let Err(e) = send(&mut stdin, &message).await {
                        warn!(worker_id = %self.id, error = %e, "worker process stdin closed");
                        break;
                    }
                }
                _ = cancelled => {
                    let Some(r) = running.as_mut() else { continue };
                    r.cancel_sent = true;
                    let message = ToWorker::Cancel { task_id: r.task_id };
                    if let Err(e) = send(&mut stdin, &message).await {
                        warn!(worker_id = %self.id, error = %e, "worker process stdin closed");
                        break;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(message) = self.relay(&line, &mut running).await {
                            if let Err(e) = send(&mut stdin, &message).await {
                                warn!(worker_id = %self.id, error = %e, "worker process stdin closed");
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        if stopping {
                            debug!(worker_id = %self.id, "worker process stopped");
                        } else {
                            warn!(worker_id = %self.id, "worker process closed its output");
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(worker_id = %self.id, error = %e, "failed to read from worker process");
                        break;
                    }
                },
            }
        }

        if !killed.is_cancelled() {
            match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(worker_id = %self.id, %status, "worker process exited"),
                Ok(Err(e)) => warn!(worker_id = %self.id, error = %e, "failed to reap worker process"),
                Err(_) => warn!(worker_id = %self.id, "worker process lingered after closing stdout"),
            }
        }
        drop(child);
        self.processes.unregister(self.id, pgid);
    }

    /// Apply one line from the child. Returns a reply for the child, if any.
    async fn relay(&self, line: &str, running: &mut Option<Running>) -> Option<ToWorker> {
        let message = match serde_json::from_str::<FromWorker>(line) {
            Ok(message) => message,
            Err(_) => {
                debug!(worker_id = %self.id, %line, "ignoring non-protocol output");
                return None;
            }
        };
        match message {
            FromWorker::Group { pgid, live: true } => self.processes.register(self.id, pgid),
            FromWorker::Group { pgid, live: false } => self.processes.unregister(self.id, pgid),
            FromWorker::Event { event } => {
                match &event {
                    Event::CostEntry {
                        task_id,
                        model,
                        category,
                        amount,
                    } => {
                        if let Err(e) = self.ledger.record(model, *category, *amount, *task_id) {
                            error!(worker_id = %self.id, error = %e, "failed to record worker cost");
                        }
                    }
                    Event::TaskDone { task_id, .. } => {
                        if running.as_ref().is_some_and(|r| r.task_id == *task_id) {
                            *running = None;
                        }
                    }
                    _ => {}
                }
                let event = match event {
                    Event::Heartbeat { .. } => Event::Heartbeat { worker_id: self.id },
                    other => other,
                };
                // Closed only when the supervisor is gone.
                let _ = self.events.emit(event).await;
            }
        }

        let r = running.as_mut()?;
        if !r.budget_sent && self.ledger.over_budget() {
            r.budget_sent = true;
            return Some(ToWorker::OverBudget);
        }
        None
    }
}

async fn send<W: AsyncWrite + Unpin>(out: &mut W, message: &impl Serialize) -> io::Result<()> {
    let mut line = serde_json::to_string(message).map_err(io::Error::other)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

/// Child side: one worker serving a supervisor over stdio
pub struct WorkerProcess {
    worker_id: WorkerId,
    groups_tx: mpsc::UnboundedSender<(i32, bool)>,
    groups_rx: mpsc::UnboundedReceiver<(i32, bool)>,
}

impl WorkerProcess {
    pub fn new(worker_id: WorkerId) -> Self {
        let (groups_tx, groups_rx) = mpsc::unbounded_channel();
        Self {
            worker_id,
            groups_tx,
            groups_rx,
        }
    }

    /// Worker whose id the supervisor passed in [`WORKER_ID_ENV`].
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(WORKER_ID_ENV)
            .map_err(|_| VigilError::Config(format!("{WORKER_ID_ENV} is not set")))?;
        let id = raw
            .trim()
            .parse()
            .map_err(|_| VigilError::Config(format!("{WORKER_ID_ENV} is not a worker id: {raw}")))?;
        Ok(Self::new(WorkerId(id)))
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Registry for the child's [`WorkerDeps`]; it reports groups upstream.
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        let tx = self.groups_tx.clone();
        Arc::new(ProcessRegistry::observed(Box::new(move |pgid, live| {
            let _ = tx.send((pgid, live));
        })))
    }

    /// Serve commands from `input` until told to stop or `input` closes.
    ///
    /// `deps.ledger` must be private to this process; its ceiling follows the
    /// budget the supervisor hands over with each task.
    pub async fn serve<R, W>(self, deps: WorkerDeps, input: R, mut output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Self {
            worker_id,
            groups_tx,
            mut groups_rx,
        } = self;
        drop(groups_tx);

        let ledger = Arc::clone(&deps.ledger);
        let (events, mut event_rx) = event_bus(CHILD_EVENT_CAPACITY, Duration::from_millis(50));
        let worker = Worker::new(worker_id, deps, events.for_worker(worker_id));
        drop(events);
        let (tx, rx) = mpsc::unbounded_channel();

        let work = async move {
            worker.serve(rx).await;
        };

        let reader = async move {
            let mut lines = BufReader::new(input).lines();
            let mut current: Option<(TaskId, CancellationToken)> = None;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to read supervisor command");
                        break;
                    }
                };
                let command = match serde_json::from_str::<ToWorker>(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed supervisor command");
                        continue;
                    }
                };
                match command {
                    ToWorker::Run {
                        task,
                        budget_remaining,
                    } => {
                        ledger.set_ceiling(ledger.spent_total() + budget_remaining);
                        let cancel = CancellationToken::new();
                        current = Some((task.id, cancel.clone()));
                        if tx.send(WorkerCommand::Run { task, cancel }).is_err() {
                            break;
                        }
                    }
                    ToWorker::Cancel { task_id } => {
                        if let Some((_, cancel)) = current.as_ref().filter(|(id, _)| *id == task_id) {
                            cancel.cancel();
                        }
                    }
                    ToWorker::OverBudget => ledger.set_ceiling(Decimal::ZERO),
                    ToWorker::Stop => break,
                }
            }
            let _ = tx.send(WorkerCommand::Stop);
        };

        let writer = async move {
            loop {
                let message = tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => FromWorker::Event { event },
                        None => break,
                    },
                    Some((pgid, live)) = groups_rx.recv() => FromWorker::Group { pgid, live },
                };
                send(&mut output, &message).await?;
            }
            output.flush().await
        };

        let ((), (), written) = tokio::join!(work, reader, writer);
        written?;
        info!(worker_id = %worker_id, "worker process done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SafetyConfig, WorkerConfig};
    use crate::safety::SafetyGate;
    use crate::testing::{calls, reply, shell, EchoTool, ScriptedBackend, ScriptedClassifier};
    use crate::tools::{ShellTool, ToolRegistry};
    use crate::types::{FailureReason, TaskKind, TaskOrigin, TaskOutcome, Verdict};
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream, Lines};

    fn child_deps(
        backend: ScriptedBackend,
        mut tools: ToolRegistry,
        processes: Arc<ProcessRegistry>,
        dir: &tempfile::TempDir,
    ) -> WorkerDeps {
        let safety = SafetyConfig::default();
        tools.extend_checked(safety.checked_tools.clone());
        let ledger = Arc::new(CostLedger::in_memory(Decimal::ZERO));
        let gate = SafetyGate::new(
            Arc::new(ScriptedClassifier::verdict(Verdict::Safe)),
            Arc::clone(&ledger),
            &safety,
        );
        WorkerDeps {
            backend: Arc::new(backend),
            tools: Arc::new(tools),
            gate: Arc::new(gate),
            ledger,
            processes,
            config: WorkerConfig::default(),
            heartbeat_interval: Duration::from_millis(50),
            workdir: dir.path().to_path_buf(),
        }
    }

    fn user_task(text: &str) -> Task {
        Task::new(TaskKind::User, json!(text), TaskOrigin::Owner).unwrap()
    }

    async fn next_message(lines: &mut Lines<BufReader<DuplexStream>>) -> FromWorker {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("worker closed its output");
        serde_json::from_str(&line).unwrap()
    }

    async fn outcome_of(lines: &mut Lines<BufReader<DuplexStream>>, task_id: TaskId) -> TaskOutcome {
        loop {
            if let FromWorker::Event {
                event: Event::TaskDone { task_id: done, outcome },
            } = next_message(lines).await
            {
                assert_eq!(done, task_id);
                return outcome;
            }
        }
    }

    #[test]
    fn test_protocol_lines() {
        let line = serde_json::to_string(&ToWorker::Cancel { task_id: TaskId::new() }).unwrap();
        assert!(line.starts_with(r#"{"op":"cancel""#));
        assert_eq!(
            serde_json::from_str::<ToWorker>(r#"{"op":"over_budget"}"#).unwrap(),
            ToWorker::OverBudget
        );
        let heartbeat: FromWorker =
            serde_json::from_str(r#"{"op":"event","event":{"type":"heartbeat","worker_id":4}}"#).unwrap();
        assert_eq!(
            heartbeat,
            FromWorker::Event {
                event: Event::Heartbeat { worker_id: WorkerId(4) }
            }
        );
    }

    #[test]
    fn test_limits_from_config() {
        let mut isolation = IsolationConfig::default();
        assert!(Limits::from_config(&isolation).is_empty());
        isolation.memory_limit_mb = 256;
        isolation.cpu_limit_secs = 30;
        let limits = Limits::from_config(&isolation);
        assert_eq!(limits.address_space, Some(256 * 1024 * 1024));
        assert_eq!(limits.cpu_secs, Some(30));
    }

    #[tokio::test]
    async fn test_child_runs_task_and_reports_groups() {
        let dir = tempfile::tempdir().unwrap();
        let process = WorkerProcess::new(WorkerId(7));
        let mut tools = ToolRegistry::new(Duration::from_secs(10));
        tools.register(Arc::new(ShellTool::new()));
        let backend = ScriptedBackend::replies(vec![shell("echo hi"), reply("said hi")]);
        let deps = child_deps(backend, tools, process.registry(), &dir);

        let (mut to_child, child_in) = duplex(64 * 1024);
        let (child_out, from_child) = duplex(64 * 1024);
        let serving = tokio::spawn(process.serve(deps, child_in, child_out));
        let mut lines = BufReader::new(from_child).lines();

        let task = user_task("say hi");
        let run = ToWorker::Run {
            task: task.clone(),
            budget_remaining: Decimal::from(10),
        };
        send(&mut to_child, &run).await.unwrap();

        let mut groups = Vec::new();
        let mut events = Vec::new();
        loop {
            match next_message(&mut lines).await {
                FromWorker::Group { pgid, live } => groups.push((pgid, live)),
                FromWorker::Event {
                    event: Event::TaskDone { task_id, outcome },
                } => {
                    assert_eq!(task_id, task.id);
                    assert!(outcome.is_success());
                    break;
                }
                FromWorker::Event { event } => events.push(event),
            }
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Heartbeat { worker_id } if *worker_id == WorkerId(7))));
        assert!(events.iter().any(|e| matches!(e, Event::ToolCall { .. })));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, groups[1].0);
        assert!(groups[0].1 && !groups[1].1);

        send(&mut to_child, &ToWorker::Stop).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_honours_budget_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let process = WorkerProcess::new(WorkerId(2));
        let mut tools = ToolRegistry::new(Duration::from_secs(10));
        tools.register(Arc::new(EchoTool::read_only("read_file")));
        let mut pricey = calls(&[("read_file", json!({"path": "a"}))]);
        pricey.cost = Decimal::new(10, 2);
        let backend = ScriptedBackend::replies(vec![pricey, calls(&[("read_file", json!({"path": "b"}))])])
            .with_delay(Duration::from_millis(200));
        let deps = child_deps(backend, tools, process.registry(), &dir);

        let (mut to_child, child_in) = duplex(64 * 1024);
        let (child_out, from_child) = duplex(64 * 1024);
        let serving = tokio::spawn(process.serve(deps, child_in, child_out));
        let mut lines = BufReader::new(from_child).lines();

        // Less budget left than the first step costs.
        let task = user_task("spend");
        let run = ToWorker::Run {
            task: task.clone(),
            budget_remaining: Decimal::new(5, 2),
        };
        send(&mut to_child, &run).await.unwrap();
        assert_eq!(
            outcome_of(&mut lines, task.id).await,
            TaskOutcome::failed(FailureReason::Budget)
        );

        let task = user_task("cancel me");
        let run = ToWorker::Run {
            task: task.clone(),
            budget_remaining: Decimal::from(10),
        };
        send(&mut to_child, &run).await.unwrap();
        send(&mut to_child, &ToWorker::Cancel { task_id: task.id }).await.unwrap();
        assert_eq!(outcome_of(&mut lines, task.id).await, TaskOutcome::Cancelled);

        drop(to_child);
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
