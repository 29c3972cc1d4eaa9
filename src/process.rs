//! Process-group registry
//!
//! Every subprocess a worker launches is the leader of a fresh process group.
//! Signalling the group reaches all of its descendants, however deep, unless
//! one of them deliberately moved to another group. Live groups are mirrored
//! to `processes.json` so the watchdog can sweep them after a hard exit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::ledger::write_atomic;
use crate::types::WorkerId;

/// How long a SIGTERM'd group gets before SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedGroups {
    groups: Vec<PersistedGroup>,
    written_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedGroup {
    worker_id: WorkerId,
    pgid: i32,
}

/// Called with `(pgid, live)` whenever a group is registered or released.
pub type GroupObserver = Box<dyn Fn(i32, bool) + Send + Sync>;

/// Tracks live process groups per worker
pub struct ProcessRegistry {
    path: Option<PathBuf>,
    groups: Mutex<BTreeMap<WorkerId, BTreeSet<i32>>>,
    observer: Option<GroupObserver>,
}

impl ProcessRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            groups: Mutex::new(BTreeMap::new()),
            observer: None,
        }
    }

    /// Registry mirrored to `path`. Any stale file is overwritten on first change.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            groups: Mutex::new(BTreeMap::new()),
            observer: None,
        }
    }

    /// In-memory registry that reports every change to `observer`.
    ///
    /// A worker child uses this to forward its groups to the supervisor,
    /// which owns the real registry.
    pub fn observed(observer: GroupObserver) -> Self {
        Self {
            path: None,
            groups: Mutex::new(BTreeMap::new()),
            observer: Some(observer),
        }
    }

    /// Scope handed to one worker.
    pub fn scope(self: &Arc<Self>, worker_id: WorkerId) -> ProcessScope {
        ProcessScope {
            registry: Arc::clone(self),
            worker_id,
        }
    }

    pub(crate) fn register(&self, worker_id: WorkerId, pgid: i32) {
        let mut groups = self.groups.lock();
        groups.entry(worker_id).or_default().insert(pgid);
        self.persist(&groups);
        if let Some(observer) = &self.observer {
            observer(pgid, true);
        }
    }

    pub(crate) fn unregister(&self, worker_id: WorkerId, pgid: i32) {
        let mut groups = self.groups.lock();
        if let Some(set) = groups.get_mut(&worker_id) {
            set.remove(&pgid);
            if set.is_empty() {
                groups.remove(&worker_id);
            }
        }
        self.persist(&groups);
        if let Some(observer) = &self.observer {
            observer(pgid, false);
        }
    }

    pub fn groups_for(&self, worker_id: WorkerId) -> Vec<i32> {
        self.groups
            .lock()
            .get(&worker_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_groups(&self) -> Vec<i32> {
        self.groups.lock().values().flatten().copied().collect()
    }

    /// Signal every group owned by `worker_id` and forget them.
    ///
    /// Without `force` the groups get SIGTERM now and SIGKILL after
    /// [`TERM_GRACE`]. Returns how many groups were still alive.
    pub fn kill_worker(&self, worker_id: WorkerId, force: bool) -> usize {
        let pgids = {
            let mut groups = self.groups.lock();
            let pgids: Vec<i32> = groups
                .remove(&worker_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            self.persist(&groups);
            pgids
        };
        if pgids.is_empty() {
            return 0;
        }
        info!(worker_id = %worker_id, groups = pgids.len(), force, "killing worker process groups");
        terminate_groups(pgids, force)
    }

    /// SIGKILL every tracked group. Used by panic.
    pub fn kill_all(&self) -> usize {
        let pgids = {
            let mut groups = self.groups.lock();
            let pgids: Vec<i32> = groups.values().flatten().copied().collect();
            groups.clear();
            self.persist(&groups);
            pgids
        };
        let alive = pgids
            .iter()
            .filter(|&&pgid| signal_group(pgid, Signal::SIGKILL))
            .count();
        info!(groups = pgids.len(), alive, "killed all tracked process groups");
        alive
    }

    fn persist(&self, groups: &BTreeMap<WorkerId, BTreeSet<i32>>) {
        let Some(path) = &self.path else {
            return;
        };
        let body = PersistedGroups {
            groups: groups
                .iter()
                .flat_map(|(worker_id, set)| {
                    set.iter().map(|&pgid| PersistedGroup {
                        worker_id: *worker_id,
                        pgid,
                    })
                })
                .collect(),
            written_at: Some(Utc::now()),
        };
        let result = serde_json::to_string_pretty(&body)
            .map_err(crate::error::VigilError::from)
            .and_then(|json| write_atomic(path, &json));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist process registry");
        }
    }
}

/// Read the process groups a (possibly dead) supervisor left behind.
pub fn read_persisted_groups(path: &Path) -> Vec<i32> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<PersistedGroups>(&contents) {
        Ok(persisted) => persisted.groups.into_iter().map(|g| g.pgid).collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable process registry");
            Vec::new()
        }
    }
}

/// Send `sig` to process group `pgid`.
///
/// Returns `false` if the group no longer exists or is not ours to signal.
pub fn signal_group(pgid: i32, sig: Signal) -> bool {
    // pgid 0 and 1 would hit our own group or init.
    if pgid <= 1 {
        warn!(pgid, "refusing to signal protected process group");
        return false;
    }
    match killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => {
            debug!(pgid, signal = ?sig, "signalled process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => {
            warn!(pgid, signal = ?sig, "permission denied signalling process group");
            false
        }
        Err(e) => {
            warn!(pgid, signal = ?sig, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Whether any member of the group is still around.
pub fn group_alive(pgid: i32) -> bool {
    pgid > 1 && killpg(Pid::from_raw(pgid), None).is_ok()
}

fn terminate_groups(pgids: Vec<i32>, force: bool) -> usize {
    if force {
        return pgids
            .iter()
            .filter(|&&pgid| signal_group(pgid, Signal::SIGKILL))
            .count();
    }
    let alive: Vec<i32> = pgids
        .into_iter()
        .filter(|&pgid| signal_group(pgid, Signal::SIGTERM))
        .collect();
    let count = alive.len();
    if count == 0 {
        return 0;
    }
    let escalate = move || {
        for pgid in alive {
            if group_alive(pgid) {
                warn!(pgid, "process group survived SIGTERM, sending SIGKILL");
                signal_group(pgid, Signal::SIGKILL);
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(TERM_GRACE).await;
                escalate();
            });
        }
        Err(_) => {
            std::thread::sleep(TERM_GRACE);
            escalate();
        }
    }
    count
}

/// A worker's view of the registry
#[derive(Clone)]
pub struct ProcessScope {
    registry: Arc<ProcessRegistry>,
    worker_id: WorkerId,
}

impl ProcessScope {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run `cmd` in a new process group and collect its output.
    ///
    /// If the returned future is dropped (cancellation, timeout, worker kill)
    /// the whole group is SIGKILLed. Members left running after the leader
    /// exits are killed too.
    pub async fn output(&self, mut cmd: Command) -> io::Result<Output> {
        cmd.process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn()?;
        let pgid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before it could be tracked"))?
            as i32;
        let _guard = GroupGuard::new(Arc::clone(&self.registry), self.worker_id, pgid);
        child.wait_with_output().await
    }
}

struct GroupGuard {
    registry: Arc<ProcessRegistry>,
    worker_id: WorkerId,
    pgid: i32,
}

impl GroupGuard {
    fn new(registry: Arc<ProcessRegistry>, worker_id: WorkerId, pgid: i32) -> Self {
        registry.register(worker_id, pgid);
        Self {
            registry,
            worker_id,
            pgid,
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        signal_group(self.pgid, Signal::SIGKILL);
        self.registry.unregister(self.worker_id, self.pgid);
    }
}
