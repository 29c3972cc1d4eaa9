#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use vigil::backend::{ToolInvocation, VersionControl};
use vigil::safety::{Assessment, ProposedAction};
use vigil::tools::ShellTool;
use vigil::{
    BackendError, Classifier, Collaborators, Context, CostLedger, Event, ReasoningBackend,
    Response, Shutdown, Supervisor, SupervisorChannel, SupervisorConfig, ToolRegistry, Verdict,
    VigilError,
};

pub const WAIT: Duration = Duration::from_secs(15);

pub fn reply(text: &str, cost: &str) -> Response {
    Response {
        model: "main".into(),
        text: text.into(),
        tool_calls: Vec::new(),
        cost: Decimal::from_str(cost).unwrap(),
    }
}

pub fn shell(cmd: &str) -> Response {
    Response {
        model: "main".into(),
        text: String::new(),
        tool_calls: vec![ToolInvocation {
            id: "call-0".into(),
            name: "run_shell".into(),
            args: json!({ "cmd": cmd }),
        }],
        cost: Decimal::ZERO,
    }
}

/// Replays responses in order; "done" once the script runs out.
pub struct FakeBackend {
    script: Mutex<VecDeque<Response>>,
    seen: Arc<Mutex<Vec<Context>>>,
    slow: Option<(String, Duration)>,
    stall: Option<(String, Duration)>,
    explode: Option<String>,
}

impl FakeBackend {
    pub fn new(script: Vec<Response>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
            slow: None,
            stall: None,
            explode: None,
        }
    }

    /// Sleep for `delay` on any call whose context mentions `needle`.
    pub fn slow_when(mut self, needle: &str, delay: Duration) -> Self {
        self.slow = Some((needle.to_string(), delay));
        self
    }

    /// Block the calling thread for `delay`, without yielding, on any call
    /// whose context mentions `needle`.
    pub fn stall_when(mut self, needle: &str, delay: Duration) -> Self {
        self.stall = Some((needle.to_string(), delay));
        self
    }

    /// Panic on any call whose context mentions `needle`.
    pub fn explode_when(mut self, needle: &str) -> Self {
        self.explode = Some(needle.to_string());
        self
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Context>>> {
        Arc::clone(&self.seen)
    }
}

fn mentions(context: &Context, needle: &str) -> bool {
    context.messages.iter().any(|m| m.content.contains(needle))
}

#[async_trait]
impl ReasoningBackend for FakeBackend {
    async fn call(&self, context: &Context) -> Result<Response, BackendError> {
        self.seen.lock().push(context.clone());
        if let Some(needle) = &self.explode {
            if mentions(context, needle) {
                panic!("backend exploded on '{needle}'");
            }
        }
        if let Some((needle, delay)) = &self.slow {
            if mentions(context, needle) {
                tokio::time::sleep(*delay).await;
            }
        }
        if let Some((needle, delay)) = &self.stall {
            if mentions(context, needle) {
                std::thread::sleep(*delay);
            }
        }
        let next = self.script.lock().pop_front();
        Ok(next.unwrap_or_else(|| reply("done", "0")))
    }
}

pub struct FakeClassifier {
    default: Verdict,
    rules: Vec<(String, Verdict)>,
}

impl FakeClassifier {
    pub fn safe() -> Self {
        Self {
            default: Verdict::Safe,
            rules: Vec::new(),
        }
    }

    pub fn when(mut self, needle: &str, verdict: Verdict) -> Self {
        self.rules.push((needle.to_string(), verdict));
        self
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, _context: &str, action: &ProposedAction) -> Result<Assessment, BackendError> {
        let described = action.describe();
        let verdict = self
            .rules
            .iter()
            .find(|(needle, _)| described.contains(needle.as_str()))
            .map(|(_, v)| *v)
            .unwrap_or(self.default);
        Ok(Assessment {
            verdict,
            reasoning: format!("classified {verdict}"),
            model: "light".into(),
            cost: Decimal::ZERO,
        })
    }
}

#[derive(Default)]
pub struct FakeVcs {
    pub snapshots: Mutex<Vec<String>>,
    pub rollbacks: Mutex<Vec<String>>,
    pub fail_rollback: bool,
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn snapshot(&self, reason: &str) -> vigil::Result<String> {
        self.snapshots.lock().push(reason.to_string());
        Ok("snap-1".into())
    }

    async fn rollback(&self, target: &str) -> vigil::Result<()> {
        if self.fail_rollback {
            return Err(VigilError::Config(format!("unknown revision {target}")));
        }
        self.rollbacks.lock().push(target.to_string());
        Ok(())
    }
}

/// Fast timings for a one-worker supervisor rooted at `dir`.
pub fn config(dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        state_dir: dir.join("state"),
        max_workers: 1,
        tick_interval_ms: 20,
        heartbeat_interval_ms: 20,
        health_grace_ms: 2_000,
        cancel_grace_ms: 200,
        restart_drain_ms: 2_000,
        ..Default::default()
    };
    config.worker.backend_retries = 0;
    config
}

pub fn collaborators(backend: FakeBackend, classifier: FakeClassifier, workdir: &Path) -> Collaborators {
    let mut tools = ToolRegistry::new(Duration::from_secs(30));
    tools.register(Arc::new(ShellTool::new()));
    Collaborators::new(Arc::new(backend), Arc::new(classifier), tools).with_workdir(workdir)
}

/// A supervisor running in the background
pub struct Harness {
    pub dir: TempDir,
    pub config: SupervisorConfig,
    pub channel: SupervisorChannel,
    pub events: broadcast::Receiver<Event>,
    pub ledger: Arc<CostLedger>,
    pub handle: JoinHandle<vigil::Result<Shutdown>>,
}

impl Harness {
    pub fn start(
        dir: TempDir,
        config: SupervisorConfig,
        collab: Collaborators,
    ) -> Self {
        let (supervisor, channel) = Supervisor::with_channel(config.clone(), collab).unwrap();
        let events = channel.subscribe();
        let ledger = supervisor.ledger();
        let handle = tokio::spawn(supervisor.run());
        Self {
            dir,
            config,
            channel,
            events,
            ledger,
            handle,
        }
    }

    /// Wait for the first event matching `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        self.collect_until(pred).await.pop().unwrap()
    }

    /// Every event up to and including the first one matching `pred`.
    pub async fn collect_until(&mut self, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            return seen;
                        }
                    }
                    Err(RecvError::Lagged(n)) => panic!("subscriber lagged by {n} events"),
                    Err(RecvError::Closed) => panic!("event stream closed; seen {seen:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait until the supervisor exits on its own.
    pub async fn finish(&mut self) -> Shutdown {
        tokio::time::timeout(WAIT, &mut self.handle)
            .await
            .expect("supervisor did not exit")
            .unwrap()
            .unwrap()
    }

    /// Close the command channel and wait for a clean stop.
    pub async fn stop(self) -> (Shutdown, TempDir) {
        let Self {
            dir, channel, handle, ..
        } = self;
        drop(channel);
        let shutdown = tokio::time::timeout(WAIT, handle)
            .await
            .expect("supervisor did not stop")
            .unwrap()
            .unwrap();
        (shutdown, dir)
    }
}

pub async fn settle(ticks: u32) {
    tokio::time::sleep(Duration::from_millis(20 * ticks as u64)).await;
}

/// Alive and not a zombie.
pub fn pid_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map(|state| state != "Z")
            .unwrap_or(false),
        Err(_) => false,
    }
}

pub async fn wait_for_pid_file(path: &Path) -> i32 {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Ok(s) = fs::read_to_string(path) {
            if let Ok(pid) = s.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_until_dead(pids: &[i32]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pids.iter().any(|&pid| pid_alive(pid)) {
        assert!(Instant::now() < deadline, "descendants still alive: {pids:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
