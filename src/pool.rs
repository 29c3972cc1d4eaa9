//! Worker pool - spawns, watches and kills workers

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CrashStormConfig, IsolationConfig, IsolationMode, SupervisorConfig, TimeoutConfig};
use crate::error::{Result, VigilError};
use crate::event::{Event, EventSender};
use crate::isolation;
use crate::queue::TaskQueue;
use crate::types::{FailureReason, Task, TaskId, TaskOutcome, WorkerId};
use crate::worker::{Worker, WorkerCommand, WorkerDeps, WorkerThread};

/// How long a graceful shutdown waits for workers to stop on their own.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Started, no heartbeat seen yet
    Starting,
    Idle,
    Busy,
    Dead,
}

/// Supervisor-side record of one worker
pub struct WorkerHandle {
    pub id: WorkerId,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    last_heartbeat: Instant,
    thread: WorkerThread,
    /// Cancellation for the task in hand.
    cancel: Option<CancellationToken>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread.join.thread().name()
    }
}

/// Health row for status reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub heartbeat_age_ms: u64,
}

/// Pool limits, taken from [`SupervisorConfig`]
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub health_grace: Duration,
    pub cancel_grace: Duration,
    pub crash_storm: CrashStormConfig,
    pub timeouts: TimeoutConfig,
    pub isolation: IsolationConfig,
}

impl PoolSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            health_grace: config.health_grace(),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            crash_storm: config.crash_storm.clone(),
            timeouts: config.timeouts.clone(),
            isolation: config.isolation.clone(),
        }
    }
}

enum Expiry {
    Hard,
    Cancel,
}

pub struct WorkerPool {
    settings: PoolSettings,
    deps: WorkerDeps,
    events: EventSender,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    next_id: u64,
    crashes: VecDeque<Instant>,
    storm: bool,
    accepting: bool,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, deps: WorkerDeps, events: EventSender) -> Self {
        Self {
            settings,
            deps,
            events,
            workers: BTreeMap::new(),
            next_id: 1,
            crashes: VecDeque::new(),
            storm: false,
            accepting: true,
        }
    }

    /// Start one worker.
    pub fn spawn(&mut self) -> Result<WorkerId> {
        if !self.accepting {
            return Err(VigilError::Config("pool is shut down".into()));
        }
        let id = WorkerId(self.next_id);
        self.next_id += 1;

        let events = self.events.for_worker(id);
        let thread = match self.settings.isolation.mode {
            IsolationMode::Thread => Worker::new(id, self.deps.clone(), events)
                .spawn(self.settings.isolation.thread_stack_bytes())?,
            IsolationMode::Process => {
                isolation::spawn_child(id, &self.settings.isolation, &self.deps, events)?
            }
        };
        self.workers.insert(
            id,
            WorkerHandle {
                id,
                status: WorkerStatus::Starting,
                current_task: None,
                last_heartbeat: Instant::now(),
                thread,
                cancel: None,
            },
        );
        Ok(id)
    }

    /// Top the pool up to `max_workers`. Does nothing during a crash storm.
    pub fn fill(&mut self) -> usize {
        let mut spawned = 0;
        while self.accepting && !self.storm && self.workers.len() < self.settings.max_workers {
            match self.spawn() {
                Ok(_) => spawned += 1,
                Err(e) => {
                    error!(error = %e, "failed to spawn worker");
                    break;
                }
            }
        }
        if spawned > 0 {
            debug!(spawned, live = self.workers.len(), "pool filled");
        }
        spawned
    }

    pub fn observe_heartbeat(&mut self, worker_id: WorkerId, now: Instant) {
        if let Some(handle) = self.workers.get_mut(&worker_id) {
            handle.last_heartbeat = now;
            if handle.status == WorkerStatus::Starting {
                handle.status = WorkerStatus::Idle;
            }
        }
    }

    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|h| h.status == WorkerStatus::Idle)
            .map(|h| h.id)
            .collect()
    }

    /// Hand `task` to an idle worker.
    pub fn dispatch(&mut self, worker_id: WorkerId, task: Task) -> Result<()> {
        let handle = self
            .workers
            .get_mut(&worker_id)
            .filter(|h| h.status == WorkerStatus::Idle)
            .ok_or(VigilError::WorkerCrash { worker_id })?;

        let cancel = CancellationToken::new();
        let task_id = task.id;
        if handle
            .thread
            .commands
            .send(WorkerCommand::Run {
                task,
                cancel: cancel.clone(),
            })
            .is_err()
        {
            handle.status = WorkerStatus::Dead;
            return Err(VigilError::WorkerCrash { worker_id });
        }
        handle.status = WorkerStatus::Busy;
        handle.current_task = Some(task_id);
        handle.cancel = Some(cancel);
        debug!(worker_id = %worker_id, task_id = %task_id, "task dispatched");
        Ok(())
    }

    /// Ask the worker holding a task to stop at its next checkpoint.
    pub fn cancel_task(&mut self, worker_id: WorkerId) -> bool {
        match self.workers.get(&worker_id).and_then(|h| h.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The worker reported a terminal outcome and is free again.
    pub fn task_finished(&mut self, worker_id: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&worker_id) {
            if handle.status == WorkerStatus::Busy {
                handle.status = WorkerStatus::Idle;
            }
            handle.current_task = None;
            handle.cancel = None;
        }
    }

    /// Detect dead workers, replace them, and trip the crash-storm guard.
    pub fn health_check(&mut self, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        let mut dead = Vec::new();
        for handle in self.workers.values_mut() {
            let reason = if handle.status == WorkerStatus::Dead {
                Some("worker channel closed".to_string())
            } else if handle.thread.join.is_finished() {
                Some("worker thread exited".to_string())
            } else {
                let silent = now.saturating_duration_since(handle.last_heartbeat);
                (silent > self.settings.health_grace)
                    .then(|| format!("no heartbeat for {}ms", silent.as_millis()))
            };
            if let Some(reason) = reason {
                handle.status = WorkerStatus::Dead;
                dead.push((handle.id, handle.current_task, reason));
            }
        }

        for (worker_id, task_id, reason) in dead {
            warn!(worker_id = %worker_id, task_id = ?task_id, %reason, "worker crashed");
            self.terminate(worker_id, true);
            events.push(Event::WorkerCrashed {
                worker_id,
                task_id,
                reason,
            });
            events.extend(self.record_crash(now));
        }

        self.fill();
        events
    }

    /// Soft warnings, hard kills, and cancellations past their grace period.
    ///
    /// Returns the resulting events, including `TaskDone` for every task
    /// taken away from its worker; the caller applies them to the queue.
    pub fn enforce_timeouts(&mut self, queue: &mut TaskQueue, now: Instant) -> Vec<Event> {
        let mut warnings = Vec::new();
        let mut expired = Vec::new();
        for binding in queue.running() {
            let task_id = binding.task.id;
            if let Some(requested) = binding.cancel_requested {
                if now.saturating_duration_since(requested) >= self.settings.cancel_grace {
                    expired.push((task_id, binding.worker_id, Expiry::Cancel));
                    continue;
                }
            }
            let policy = self.settings.timeouts.for_kind(binding.task.kind);
            let elapsed = now.saturating_duration_since(binding.started);
            if elapsed >= policy.hard() {
                expired.push((task_id, binding.worker_id, Expiry::Hard));
            } else if elapsed >= policy.soft() && !binding.soft_warned {
                warnings.push((task_id, elapsed));
            }
        }

        let mut events = Vec::new();
        for (task_id, elapsed) in warnings {
            warn!(task_id = %task_id, elapsed_ms = elapsed.as_millis() as u64, "task past soft timeout");
            queue.mark_soft_warned(task_id);
            events.push(Event::TimeoutWarning {
                task_id,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        for (task_id, worker_id, expiry) in expired {
            let (reason, outcome) = match expiry {
                Expiry::Hard => ("hard timeout", TaskOutcome::failed(FailureReason::Timeout)),
                Expiry::Cancel => ("cancel not honoured", TaskOutcome::Cancelled),
            };
            warn!(task_id = %task_id, worker_id = %worker_id, reason, "force-killing worker");
            events.extend(self.kill(worker_id, true, reason));
            events.push(Event::TaskDone { task_id, outcome });
        }
        if !events.is_empty() {
            self.fill();
        }
        events
    }

    /// Kill a worker and every process group it started.
    pub fn kill(&mut self, worker_id: WorkerId, force: bool, reason: &str) -> Option<Event> {
        self.terminate(worker_id, force)?;
        info!(worker_id = %worker_id, force, reason, "worker killed");
        Some(Event::WorkerKilled {
            worker_id,
            reason: reason.to_string(),
        })
    }

    fn terminate(&mut self, worker_id: WorkerId, force: bool) -> Option<WorkerHandle> {
        let handle = self.workers.remove(&worker_id)?;
        if let Some(cancel) = &handle.cancel {
            cancel.cancel();
        }
        handle.thread.kill.cancel();
        self.deps.processes.kill_worker(worker_id, force);
        if !handle.thread.join.is_finished() {
            // Dropping the JoinHandle detaches the thread; its runtime exits at
            // the next await once the kill token is observed.
            debug!(worker_id = %worker_id, "worker thread detached");
        }
        Some(handle)
    }

    fn record_crash(&mut self, now: Instant) -> Option<Event> {
        let window = Duration::from_millis(self.settings.crash_storm.window_ms);
        self.crashes.push_back(now);
        while let Some(&first) = self.crashes.front() {
            if now.saturating_duration_since(first) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        if !self.storm && self.crashes.len() > self.settings.crash_storm.max_crashes {
            self.storm = true;
            error!(
                crashes = self.crashes.len(),
                window_ms = self.settings.crash_storm.window_ms,
                "crash storm, respawning paused"
            );
            return Some(Event::CrashStorm {
                crashes: self.crashes.len(),
                window_ms: self.settings.crash_storm.window_ms,
            });
        }
        None
    }

    pub fn in_crash_storm(&self) -> bool {
        self.storm
    }

    /// Clear the crash-storm latch and respawn.
    pub fn reset_crash_guard(&mut self) {
        self.storm = false;
        self.crashes.clear();
        info!("crash guard reset");
        self.fill();
    }

    /// Stop all workers. Without `force`, workers get a short chance to exit.
    pub async fn shutdown(&mut self, force: bool) {
        self.accepting = false;
        if !force {
            for handle in self.workers.values() {
                let _ = handle.thread.commands.send(WorkerCommand::Stop);
            }
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline
                && self.workers.values().any(|h| !h.thread.join.is_finished())
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in &ids {
            self.terminate(*id, force);
        }
        info!(workers = ids.len(), force, "pool shut down");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&worker_id)
    }

    pub fn summaries(&self, now: Instant) -> Vec<WorkerSummary> {
        self.workers
            .values()
            .map(|h| WorkerSummary {
                worker_id: h.id,
                status: h.status,
                current_task: h.current_task,
                heartbeat_age_ms: now.saturating_duration_since(h.last_heartbeat).as_millis() as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Context, ReasoningBackend, Response};
    use crate::config::{SafetyConfig, TimeoutPolicy, WorkerConfig};
    use crate::event::{event_bus, EventReceiver};
    use crate::ledger::CostLedger;
    use crate::process::ProcessRegistry;
    use crate::safety::SafetyGate;
    use crate::testing::{reply, ScriptedBackend, ScriptedClassifier};
    use crate::tools::ToolRegistry;
    use crate::types::{TaskKind, TaskOrigin, Verdict};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::sync::Arc;

    struct PanickingBackend;

    #[async_trait]
    impl ReasoningBackend for PanickingBackend {
        async fn call(&self, _context: &Context) -> std::result::Result<Response, BackendError> {
            panic!("backend exploded");
        }
    }

    fn settings(max_workers: usize) -> PoolSettings {
        let mut config = SupervisorConfig {
            max_workers,
            cancel_grace_ms: 100,
            ..Default::default()
        };
        config.timeouts.per_kind.insert(
            TaskKind::User,
            TimeoutPolicy {
                soft_ms: 50,
                hard_ms: 150,
            },
        );
        PoolSettings::from_config(&config)
    }

    fn pool_with(backend: Arc<dyn ReasoningBackend>, settings: PoolSettings) -> (WorkerPool, EventReceiver) {
        let ledger = Arc::new(CostLedger::in_memory(Decimal::from(10)));
        let deps = WorkerDeps {
            backend,
            tools: Arc::new(ToolRegistry::new(Duration::from_secs(1))),
            gate: Arc::new(SafetyGate::new(
                Arc::new(ScriptedClassifier::verdict(Verdict::Safe)),
                Arc::clone(&ledger),
                &SafetyConfig::default(),
            )),
            ledger,
            processes: Arc::new(ProcessRegistry::in_memory()),
            config: WorkerConfig::default(),
            heartbeat_interval: Duration::from_millis(20),
            workdir: std::env::temp_dir(),
        };
        let (tx, rx) = event_bus(1024, Duration::from_millis(5));
        (WorkerPool::new(settings, deps, tx), rx)
    }

    /// Apply heartbeats until every worker is idle; returns other events.
    async fn settle(pool: &mut WorkerPool, rx: &mut EventReceiver) -> Vec<Event> {
        let mut other = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for event in rx.drain(1024) {
                match event {
                    Event::Heartbeat { worker_id } => pool.observe_heartbeat(worker_id, Instant::now()),
                    e => other.push(e),
                }
            }
            if pool.idle_workers().len() == pool.len() {
                return other;
            }
            assert!(Instant::now() < deadline, "workers never became idle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn user_task() -> Task {
        Task::new(TaskKind::User, json!("work"), TaskOrigin::Owner).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fill_and_idle() {
        let (mut pool, mut rx) = pool_with(Arc::new(ScriptedBackend::replies(vec![])), settings(3));
        assert_eq!(pool.fill(), 3);
        assert_eq!(pool.fill(), 0);
        assert!(pool
            .summaries(Instant::now())
            .iter()
            .all(|s| s.status == WorkerStatus::Starting));

        settle(&mut pool, &mut rx).await;
        assert_eq!(pool.idle_workers().len(), 3);
        pool.shutdown(false).await;
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hard_timeout_kills_and_respawns() {
        let backend = ScriptedBackend::replies(vec![reply("late")]).with_delay(Duration::from_secs(30));
        let (mut pool, mut rx) = pool_with(Arc::new(backend), settings(1));
        pool.fill();
        settle(&mut pool, &mut rx).await;

        let mut queue = TaskQueue::new();
        let task_id = queue.enqueue(user_task()).unwrap();
        for (task, worker_id) in queue.assign(&pool.idle_workers()) {
            pool.dispatch(worker_id, task).unwrap();
        }
        let first_worker = queue.binding(task_id).unwrap().worker_id;
        let started = queue.binding(task_id).unwrap().started;

        let soft = pool.enforce_timeouts(&mut queue, started + Duration::from_millis(60));
        assert!(matches!(soft.as_slice(), [Event::TimeoutWarning { .. }]));
        let again = pool.enforce_timeouts(&mut queue, started + Duration::from_millis(70));
        assert!(again.is_empty(), "soft warning repeated");

        let hard = pool.enforce_timeouts(&mut queue, started + Duration::from_millis(160));
        assert!(hard.iter().any(|e| matches!(e, Event::WorkerKilled { worker_id, .. } if *worker_id == first_worker)));
        assert!(hard.contains(&Event::TaskDone {
            task_id,
            outcome: TaskOutcome::failed(FailureReason::Timeout),
        }));
        assert_eq!(pool.len(), 1);
        assert!(pool.get(first_worker).is_none());
        assert!(!pool.in_crash_storm());
        pool.shutdown(true).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhonoured_cancel_is_forced() {
        let backend = ScriptedBackend::replies(vec![reply("late")]).with_delay(Duration::from_secs(30));
        let (mut pool, mut rx) = pool_with(Arc::new(backend), settings(1));
        pool.fill();
        settle(&mut pool, &mut rx).await;

        let mut queue = TaskQueue::new();
        let task_id = queue.enqueue(user_task()).unwrap();
        for (task, worker_id) in queue.assign(&pool.idle_workers()) {
            pool.dispatch(worker_id, task).unwrap();
        }
        let requested = Instant::now();
        let crate::queue::Cancelled::Signal(worker_id) = queue.cancel(task_id, requested).unwrap() else {
            panic!("expected running task");
        };
        assert!(pool.cancel_task(worker_id));

        let events = pool.enforce_timeouts(&mut queue, requested + Duration::from_millis(120));
        assert!(events.contains(&Event::TaskDone {
            task_id,
            outcome: TaskOutcome::Cancelled,
        }));
        pool.shutdown(true).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_worker_is_detected() {
        let (mut pool, mut rx) = pool_with(Arc::new(PanickingBackend), settings(1));
        pool.fill();
        settle(&mut pool, &mut rx).await;

        let task = user_task();
        let task_id = task.id;
        let worker_id = pool.idle_workers()[0];
        pool.dispatch(worker_id, task).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let crashed = loop {
            let events = pool.health_check(Instant::now());
            if let Some(e) = events.into_iter().find(|e| matches!(e, Event::WorkerCrashed { .. })) {
                break e;
            }
            assert!(Instant::now() < deadline, "crash never detected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(matches!(
            crashed,
            Event::WorkerCrashed { worker_id: w, task_id: Some(t), .. } if w == worker_id && t == task_id
        ));
        // Replaced by a fresh slot.
        assert_eq!(pool.len(), 1);
        assert!(pool.get(worker_id).is_none());
        pool.shutdown(true).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_workers_marked_dead_and_storm_latches() {
        let mut s = settings(2);
        s.crash_storm = CrashStormConfig {
            max_crashes: 2,
            window_ms: 60_000,
        };
        let (mut pool, mut rx) = pool_with(Arc::new(ScriptedBackend::replies(vec![])), s);
        pool.fill();
        settle(&mut pool, &mut rx).await;

        let later = Instant::now() + Duration::from_secs(120);
        let events = pool.health_check(later);
        let crashes = events.iter().filter(|e| matches!(e, Event::WorkerCrashed { .. })).count();
        assert_eq!(crashes, 2);
        assert!(!pool.in_crash_storm());
        assert_eq!(pool.len(), 2);

        let events = pool.health_check(later + Duration::from_secs(1));
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::CrashStorm { .. })).count(),
            1
        );
        assert!(pool.in_crash_storm());
        assert_eq!(pool.len(), 0, "respawning must pause during a storm");

        pool.reset_crash_guard();
        assert_eq!(pool.len(), 2);
        pool.shutdown(true).await;
    }
}
