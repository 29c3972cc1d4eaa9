//! Outer watchdog for a vigil supervisor process.
//!
//! Launches the supervisor command in its own process group and reacts to its
//! exit code: relaunch on restart, sweep orphaned process groups and stay down
//! on panic, relaunch with backoff after a crash until crashes cluster.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use fs2::FileExt;
use nix::sys::signal::Signal;
use tracing::{error, info, warn};

use vigil::exit_codes;
use vigil::logging;
use vigil::process::{read_persisted_groups, signal_group};

#[derive(Parser)]
#[command(
    name = "vigil-watchdog",
    version,
    about = "Keep a vigil supervisor running and clean up after it"
)]
struct Cli {
    /// Supervisor state directory (pid lock, processes.json).
    #[arg(long, default_value = ".vigil")]
    state_dir: PathBuf,

    /// Crashes tolerated inside the window before giving up.
    #[arg(long, default_value_t = 5)]
    max_crashes: usize,

    #[arg(long, default_value_t = 120)]
    window_secs: u64,

    /// Pause before relaunching after a crash.
    #[arg(long, default_value_t = 3)]
    backoff_secs: u64,

    /// Supervisor command line.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    logging::init("info");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("create {}", cli.state_dir.display()))?;
    let _lock = PidLock::acquire(&cli.state_dir.join("vigil.pid"))?;
    let registry = cli.state_dir.join("processes.json");

    let Some((program, args)) = cli.command.split_first() else {
        bail!("no supervisor command given");
    };
    let mut crashes = CrashWindow::new(cli.max_crashes, Duration::from_secs(cli.window_secs));

    loop {
        let mut child = Command::new(program)
            .args(args)
            .process_group(0)
            .spawn()
            .with_context(|| format!("launch {program}"))?;
        let pgid = child.id() as i32;
        info!(pid = pgid, program = %program, "supervisor launched");

        let status = child.wait().context("wait for supervisor")?;
        match status.code() {
            Some(exit_codes::OK) => {
                info!("supervisor stopped cleanly");
                return Ok(exit_codes::OK);
            }
            Some(exit_codes::RESTART) => {
                info!("restart requested, relaunching");
            }
            Some(exit_codes::PANIC) => {
                let swept = sweep(pgid, &registry);
                warn!(swept, "panic stop, orphans swept, not relaunching");
                return Ok(exit_codes::PANIC);
            }
            code => {
                let swept = sweep(pgid, &registry);
                warn!(
                    code = ?code,
                    signal = ?status.signal(),
                    swept,
                    "supervisor crashed"
                );
                if crashes.record(Instant::now()) {
                    error!(
                        crashes = crashes.len(),
                        window_secs = cli.window_secs,
                        "crash storm, giving up"
                    );
                    return Ok(exit_codes::CRASH_STORM);
                }
                thread::sleep(Duration::from_secs(cli.backoff_secs));
            }
        }
    }
}

/// SIGKILL the supervisor's own group and every group it recorded.
fn sweep(child_pgid: i32, registry: &Path) -> usize {
    let mut groups = read_persisted_groups(registry);
    groups.push(child_pgid);
    groups.sort_unstable();
    groups.dedup();
    let killed = groups
        .into_iter()
        .filter(|&pgid| signal_group(pgid, Signal::SIGKILL))
        .count();
    // Stale pgids could be recycled by unrelated processes.
    if let Err(e) = fs::remove_file(registry) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %registry.display(), error = %e, "failed to clear process registry");
        }
    }
    killed
}

/// Exclusive lock on the pid file, held for the watchdog's lifetime.
struct PidLock {
    _file: File,
}

impl PidLock {
    fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(path).unwrap_or_default();
            bail!(
                "another watchdog holds {} (pid {})",
                path.display(),
                holder.trim()
            );
        }
        file.set_len(0).context("truncate pid file")?;
        writeln!(file, "{}", std::process::id()).context("write pid file")?;
        Ok(Self { _file: file })
    }
}

/// Rolling count of crashes
struct CrashWindow {
    max: usize,
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl CrashWindow {
    fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash; true once `max` crashes fall inside the window.
    fn record(&mut self, now: Instant) -> bool {
        self.crashes.push_back(now);
        while let Some(&first) = self.crashes.front() {
            if now.saturating_duration_since(first) > self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.len() >= self.max
    }

    fn len(&self) -> usize {
        self.crashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_window_trips_at_max() {
        let start = Instant::now();
        let mut window = CrashWindow::new(5, Duration::from_secs(120));
        for i in 0..4 {
            assert!(!window.record(start + Duration::from_secs(i)));
        }
        assert!(window.record(start + Duration::from_secs(4)));
    }

    #[test]
    fn test_crash_window_forgets_old_crashes() {
        let start = Instant::now();
        let mut window = CrashWindow::new(3, Duration::from_secs(10));
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(1)));
        assert!(!window.record(start + Duration::from_secs(30)));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_pid_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.pid");
        let held = PidLock::acquire(&path).unwrap();
        let err = PidLock::acquire(&path).err().unwrap();
        assert!(err.to_string().contains("another watchdog"));
        drop(held);
        assert!(PidLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_sweep_clears_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("processes.json");
        fs::write(&registry, r#"{"groups":[],"written_at":null}"#).unwrap();
        // pgid 1 is refused, so nothing real is signalled.
        assert_eq!(sweep(1, &registry), 0);
        assert!(!registry.exists());
    }
}
