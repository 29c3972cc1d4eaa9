//! # Vigil
//!
//! Autonomous task supervisor - the one that stays awake.
//!
//! Vigil accepts tasks for a long-running agent, runs each one in an
//! isolated worker, enforces time and cost budgets, gates every mutating
//! action through a safety layer, and can stop the whole process tree on
//! demand (panic) or restart it cleanly.
//!
//! ## Architecture
//!
//! ```text
//!   owner / UI ──commands──►┌──────────────────────────────────────────┐
//!              ◄──events────│              SUPERVISOR LOOP              │
//!              ◄──status────│  ┌────────────┐ ┌───────────┐ ┌────────┐ │
//!                           │  │ Task Queue │ │Worker Pool│ │Snapshot│ │
//!                           │  └────────────┘ └─────┬─────┘ └────────┘ │
//!                           └───────▲───────────────┼──────────────────┘
//!                                   │ event bus     │ task in
//!                  ┌────────────────┼───────────────┼────────────────┐
//!                  ▼                │               ▼                ▼
//!           ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//!           │  Worker w1  │  │  Worker w2  │  │  Worker w3  │  child process
//!           │  (runtime)  │  │  (runtime)  │  │  (runtime)  │  or thread,
//!           └──────┬──────┘  └─────────────┘  └─────────────┘  + pgroups
//!                  │
//!       ┌──────────┼──────────────┬───────────────┐
//!       ▼          ▼              ▼               ▼
//!   Backend    Tool Registry   Safety Gate    Cost Ledger
//!                              (guard + 2     (exact decimals,
//!                               classifiers)   JSONL on disk)
//! ```
//!
//! ## Key Concepts
//!
//! - **Task**: one unit of work with identity and a terminal outcome
//! - **Worker**: runs one task at a time, either as a child process in its
//!   own process group (with rlimit caps) or on a dedicated thread
//! - **Safety Gate**: verdict layer every mutating tool call must pass
//! - **Cost Ledger**: exact, persisted spend with a budget ceiling
//! - **Watchdog**: outer launcher (`vigil-watchdog`) that relaunches on
//!   restart and sweeps orphaned process groups after a panic

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod exit_codes;
pub mod guard;
pub mod isolation;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod pool;
pub mod process;
pub mod queue;
pub mod safety;
pub mod settings;
pub mod snapshot;
pub mod supervisor;
pub mod tools;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, Context, ReasoningBackend, Response, VersionControl};
pub use channel::{ChannelPair, Command, SupervisorChannel};
pub use config::{load_config, IsolationConfig, IsolationMode, SupervisorConfig, SuspiciousPolicy};
pub use error::{Result, VigilError};
pub use event::Event;
pub use isolation::WorkerProcess;
pub use ledger::CostLedger;
pub use safety::{Classifier, SafetyGate};
pub use supervisor::{Collaborators, Shutdown, Supervisor, SupervisorStatus};
pub use tools::{Capability, Tool, ToolRegistry};
pub use types::{Task, TaskId, TaskKind, TaskOutcome, Verdict, WorkerId};
