//! Control channels between the supervisor and its clients

use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{Result, VigilError};
use crate::event::Event;
use crate::queue::{Cancelled, TaskState};
use crate::supervisor::SupervisorStatus;
use crate::types::{TaskId, TaskKind, TaskOrigin, TaskRequest};

/// Owner commands, applied by the supervisor between ticks
#[derive(Debug)]
pub enum Command {
    Enqueue {
        request: TaskRequest,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<Cancelled>>,
    },
    TaskState {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskState>>,
    },
    /// Drain, snapshot, and exit for the watchdog to relaunch.
    Restart { reason: String },
    /// Like restart, but roll the code back to `target` first.
    Rollback { target: String },
    /// Kill everything now and stay down.
    Panic { reason: String },
    PauseKind(TaskKind),
    ResumeKind(TaskKind),
    RaiseBudget(Decimal),
    ResetCrashGuard,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueue { .. } => "enqueue",
            Self::Cancel { .. } => "cancel",
            Self::TaskState { .. } => "task_state",
            Self::Restart { .. } => "restart",
            Self::Rollback { .. } => "rollback",
            Self::Panic { .. } => "panic",
            Self::PauseKind(_) => "pause_kind",
            Self::ResumeKind(_) => "resume_kind",
            Self::RaiseBudget(_) => "raise_budget",
            Self::ResetCrashGuard => "reset_crash_guard",
        }
    }
}

/// Supervisor-side ends
pub struct ChannelPair {
    pub cmd_rx: mpsc::UnboundedReceiver<Command>,
    pub events: broadcast::Sender<Event>,
    pub status: watch::Sender<SupervisorStatus>,
}

/// Client handle for a running supervisor
#[derive(Clone)]
pub struct SupervisorChannel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorChannel {
    /// Create a new channel pair
    ///
    /// `event_capacity` bounds how far a slow subscriber may lag before it
    /// starts missing events.
    pub fn new(event_capacity: usize) -> (Self, ChannelPair) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());

        let channel = Self {
            cmd_tx,
            events: events.clone(),
            status: status_rx,
        };
        let pair = ChannelPair {
            cmd_rx,
            events,
            status: status_tx,
        };
        (channel, pair)
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| VigilError::ChannelClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| VigilError::ChannelClosed)?
    }

    /// Submit an owner task.
    pub async fn enqueue(&self, kind: TaskKind, payload: Value) -> Result<TaskId> {
        self.submit(TaskRequest {
            kind: Some(kind.to_string()),
            payload: Some(payload),
            origin: TaskOrigin::Owner,
        })
        .await
    }

    /// Submit an unvalidated request; malformed ones are rejected.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        self.request(|reply| Command::Enqueue { request, reply }).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<Cancelled> {
        self.request(|reply| Command::Cancel { task_id, reply }).await
    }

    /// Where a task stands; `None` if the supervisor has never seen it.
    pub async fn task_state(&self, task_id: TaskId) -> Result<Option<TaskState>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TaskState { task_id, reply })?;
        rx.await.map_err(|_| VigilError::ChannelClosed)
    }

    pub fn restart(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Command::Restart {
            reason: reason.into(),
        })
    }

    pub fn rollback(&self, target: impl Into<String>) -> Result<()> {
        self.send(Command::Rollback {
            target: target.into(),
        })
    }

    pub fn panic(&self, reason: impl Into<String>) -> Result<()> {
        self.send(Command::Panic {
            reason: reason.into(),
        })
    }

    pub fn pause_kind(&self, kind: TaskKind) -> Result<()> {
        self.send(Command::PauseKind(kind))
    }

    pub fn resume_kind(&self, kind: TaskKind) -> Result<()> {
        self.send(Command::ResumeKind(kind))
    }

    pub fn raise_budget(&self, ceiling: Decimal) -> Result<()> {
        self.send(Command::RaiseBudget(ceiling))
    }

    pub fn reset_crash_guard(&self) -> Result<()> {
        self.send(Command::ResetCrashGuard)
    }

    /// Latest published status.
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Watch status updates.
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_creation() {
        let (channel, _pair) = SupervisorChannel::new(16);
        assert!(!channel.is_closed());
        assert_eq!(channel.status(), SupervisorStatus::default());
    }

    #[test]
    fn test_closed_after_pair_dropped() {
        let (channel, pair) = SupervisorChannel::new(16);
        drop(pair);
        assert!(channel.is_closed());
        assert!(matches!(channel.restart("x"), Err(VigilError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_enqueue_round_trip() {
        let (channel, mut pair) = SupervisorChannel::new(16);
        let server = tokio::spawn(async move {
            match pair.cmd_rx.recv().await {
                Some(Command::Enqueue { request, reply }) => {
                    let task = request.into_task().map(|t| t.id);
                    let _ = reply.send(task);
                }
                other => panic!("unexpected command {other:?}"),
            }
        });

        tokio_test::assert_ok!(channel.enqueue(TaskKind::User, json!("hello")).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_reply_is_channel_closed() {
        let (channel, mut pair) = SupervisorChannel::new(16);
        tokio::spawn(async move {
            // Drop the command, and with it the reply sender.
            let _ = pair.cmd_rx.recv().await;
        });
        let err = tokio_test::assert_err!(channel.cancel(TaskId::new()).await);
        assert!(matches!(err, VigilError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let (channel, pair) = SupervisorChannel::new(16);
        let mut rx = channel.subscribe();
        let event = Event::Control {
            command: "restart".into(),
            detail: "test".into(),
        };
        pair.events.send(event.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
