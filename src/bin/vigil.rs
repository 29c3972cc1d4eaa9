//! vigil supervisor process.
//!
//! `vigil run` starts a supervisor, reads owner commands as JSON lines on
//! stdin and prints events as JSON lines on stdout. Its exit code tells the
//! watchdog what to do next. `vigil worker` is the child side of process
//! isolation and is started by `run` itself.
//!
//! The reasoning backend and the safety classifiers are external programs
//! named under `[agent]` in the config file. Each call runs the program once,
//! writes the request as JSON to its stdin and reads one JSON reply from its
//! stdout.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use vigil::backend::{BackendError, Context, ReasoningBackend, Response};
use vigil::exit_codes;
use vigil::logging;
use vigil::safety::{Assessment, Classifier, ProposedAction};
use vigil::tools::{ShellTool, ToolRegistry};
use vigil::types::{TaskId, TaskKind, TaskRequest, Verdict};
use vigil::{
    Collaborators, CostLedger, Event, IsolationMode, Supervisor, SupervisorChannel,
    SupervisorConfig, WorkerProcess,
};

#[derive(Parser)]
#[command(name = "vigil", version, about = "Autonomous task supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the supervisor.
    Run {
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,

        /// Overrides `isolation.mode` from the config file.
        #[arg(long, value_enum)]
        isolation: Option<Isolation>,
    },
    /// Serve one worker over stdio (started by `run`).
    Worker {
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Isolation {
    Process,
    Thread,
}

/// `[agent]` section: the external programs vigil drives
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentConfig {
    backend_command: Vec<String>,
    classifier_command: Vec<String>,
    escalation_command: Vec<String>,
    workdir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentFile {
    #[serde(default)]
    agent: AgentConfig,
}

impl AgentConfig {
    fn collaborators(&self) -> Result<Collaborators> {
        if self.backend_command.is_empty() {
            bail!("agent.backend_command is required");
        }
        if self.classifier_command.is_empty() {
            warn!("no agent.classifier_command, every checked tool call will be refused");
        }
        let mut tools = ToolRegistry::new(std::time::Duration::from_secs(120));
        tools.register(Arc::new(ShellTool::new()));
        let mut collab = Collaborators::new(
            Arc::new(CommandBackend {
                argv: self.backend_command.clone(),
            }),
            Arc::new(CommandClassifier {
                argv: self.classifier_command.clone(),
            }),
            tools,
        );
        if !self.escalation_command.is_empty() {
            collab = collab.with_escalation(Arc::new(CommandClassifier {
                argv: self.escalation_command.clone(),
            }));
        }
        if let Some(workdir) = &self.workdir {
            collab = collab.with_workdir(workdir);
        }
        Ok(collab)
    }
}

/// Read both halves of the config file; a missing file means defaults.
fn read_config(path: &Path) -> Result<(SupervisorConfig, AgentConfig)> {
    if !path.exists() {
        return Ok((SupervisorConfig::default(), AgentConfig::default()));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let agent: AgentFile = toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok((config, agent.agent))
}

#[tokio::main]
async fn main() {
    logging::init("info");
    let cli = Cli::parse();
    let result = match cli.command {
        Mode::Run { config, isolation } => run(&config, isolation).await,
        Mode::Worker { config } => worker(&config).await,
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    }
}

async fn run(path: &Path, isolation: Option<Isolation>) -> Result<i32> {
    let (mut config, agent) = read_config(path)?;
    match isolation {
        Some(Isolation::Process) => config.isolation.mode = IsolationMode::Process,
        Some(Isolation::Thread) => config.isolation.mode = IsolationMode::Thread,
        None => {}
    }
    if config.isolation.mode == IsolationMode::Process && config.isolation.worker_command.is_empty() {
        let exe = std::env::current_exe().context("locate vigil executable")?;
        // Children run in the tools' workdir, so hand them an absolute path.
        let config_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        config.isolation.worker_command = vec![
            exe.display().to_string(),
            "worker".into(),
            "--config".into(),
            config_path.display().to_string(),
        ];
    }

    let collab = agent.collaborators()?;
    let (supervisor, channel) = Supervisor::with_channel(config, collab)?;

    let mut events = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_line(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    print_line(&Event::Control {
        command: "start".into(),
        detail: format!("pid {}", std::process::id()),
    });
    tokio::spawn(read_commands(channel));

    let shutdown = supervisor.run().await?;
    Ok(shutdown.exit_code())
}

async fn worker(path: &Path) -> Result<i32> {
    let (mut config, agent) = read_config(path)?;
    // The parent supervisor owns isolation; the child only runs tasks.
    config.isolation.mode = IsolationMode::Thread;
    config.validate()?;
    let process = WorkerProcess::from_env()?;
    let ledger = Arc::new(CostLedger::in_memory(Decimal::ZERO));
    let deps = agent
        .collaborators()?
        .into_worker_deps(&config, ledger, process.registry());
    info!(worker_id = %process.worker_id(), "worker process ready");
    process
        .serve(deps, tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(exit_codes::OK)
}

/// Owner commands accepted on stdin
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OwnerCommand {
    Enqueue(TaskRequest),
    Cancel { task_id: TaskId },
    Restart {
        #[serde(default)]
        reason: String,
    },
    Rollback { target: String },
    Panic {
        #[serde(default)]
        reason: String,
    },
    PauseKind { kind: TaskKind },
    ResumeKind { kind: TaskKind },
    RaiseBudget { ceiling: Decimal },
    ResetCrashGuard,
    Status,
}

/// Apply stdin commands until stdin closes, which stops the supervisor.
async fn read_commands(channel: SupervisorChannel) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<OwnerCommand>(&line) {
            Ok(command) => apply(&channel, command).await,
            Err(e) => json!({ "reply": "error", "error": format!("unreadable command: {e}") }),
        };
        print_line(&reply);
    }
    info!("stdin closed, stopping");
}

async fn apply(channel: &SupervisorChannel, command: OwnerCommand) -> Value {
    let result = match command {
        OwnerCommand::Enqueue(request) => channel
            .submit(request)
            .await
            .map(|task_id| json!({ "reply": "enqueued", "task_id": task_id })),
        OwnerCommand::Cancel { task_id } => channel
            .cancel(task_id)
            .await
            .map(|result| json!({ "reply": "cancel", "task_id": task_id, "result": format!("{result:?}") })),
        OwnerCommand::Restart { reason } => channel.restart(reason).map(|()| json!({ "reply": "restarting" })),
        OwnerCommand::Rollback { target } => channel.rollback(target).map(|()| json!({ "reply": "rolling_back" })),
        OwnerCommand::Panic { reason } => channel.panic(reason).map(|()| json!({ "reply": "panicking" })),
        OwnerCommand::PauseKind { kind } => channel.pause_kind(kind).map(|()| json!({ "reply": "paused", "kind": kind })),
        OwnerCommand::ResumeKind { kind } => channel.resume_kind(kind).map(|()| json!({ "reply": "resumed", "kind": kind })),
        OwnerCommand::RaiseBudget { ceiling } => channel
            .raise_budget(ceiling)
            .map(|()| json!({ "reply": "budget", "ceiling": ceiling })),
        OwnerCommand::ResetCrashGuard => channel.reset_crash_guard().map(|()| json!({ "reply": "crash_guard_reset" })),
        OwnerCommand::Status => Ok(json!({ "reply": "status", "status": channel.status() })),
    };
    result.unwrap_or_else(|e| json!({ "reply": "error", "error": e.to_string() }))
}

fn print_line(value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to encode output line"),
    }
}

/// Run `argv` once with `input` on stdin and return its stdout.
async fn exchange(argv: &[String], input: Vec<u8>) -> std::result::Result<Vec<u8>, BackendError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(BackendError::Fatal("no command configured".into()));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::Fatal(format!("launch {program}: {e}")))?;
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A program that exits without reading is judged by its output.
            let _ = stdin.write_all(&input).await;
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    let output = output.map_err(|e| BackendError::Transient(format!("wait for {program}: {e}")))?;
    if !output.status.success() {
        return Err(BackendError::Transient(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Backend served by an external program: context in, [`Response`] out
struct CommandBackend {
    argv: Vec<String>,
}

#[async_trait]
impl ReasoningBackend for CommandBackend {
    async fn call(&self, context: &Context) -> std::result::Result<Response, BackendError> {
        let input = serde_json::to_vec(context).map_err(|e| BackendError::Fatal(e.to_string()))?;
        let output = exchange(&self.argv, input).await?;
        serde_json::from_slice(&output)
            .map_err(|e| BackendError::Fatal(format!("unreadable backend reply: {e}")))
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    context: &'a str,
    tool: &'a str,
    args: &'a Value,
}

#[derive(Deserialize)]
struct ClassifyReply {
    verdict: Verdict,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    cost: Decimal,
}

/// Classifier served by an external program
struct CommandClassifier {
    argv: Vec<String>,
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(
        &self,
        context: &str,
        action: &ProposedAction,
    ) -> std::result::Result<Assessment, BackendError> {
        let request = ClassifyRequest {
            context,
            tool: &action.tool,
            args: &action.args,
        };
        let input = serde_json::to_vec(&request).map_err(|e| BackendError::Fatal(e.to_string()))?;
        let output = exchange(&self.argv, input).await?;
        let reply: ClassifyReply = serde_json::from_slice(&output)
            .map_err(|e| BackendError::Fatal(format!("unreadable classifier reply: {e}")))?;
        Ok(Assessment {
            verdict: reply.verdict,
            reasoning: reply.reasoning,
            model: reply.model.unwrap_or_else(|| "classifier".into()),
            cost: reply.cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil::types::TaskOrigin;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn test_owner_commands_parse() {
        let enqueue: OwnerCommand =
            serde_json::from_str(r#"{"op":"enqueue","kind":"user","payload":"hello"}"#).unwrap();
        assert!(matches!(
            enqueue,
            OwnerCommand::Enqueue(TaskRequest { kind: Some(ref k), .. }) if k == "user"
        ));
        let panic: OwnerCommand = serde_json::from_str(r#"{"op":"panic"}"#).unwrap();
        assert!(matches!(panic, OwnerCommand::Panic { ref reason } if reason.is_empty()));
        assert!(serde_json::from_str::<OwnerCommand>(r#"{"op":"explode"}"#).is_err());
    }

    #[test]
    fn test_agent_section_is_read_beside_supervisor_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        fs::write(
            &path,
            r#"
max_workers = 2

[agent]
backend_command = ["my-backend", "--fast"]
"#,
        )
        .unwrap();
        let (config, agent) = read_config(&path).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(agent.backend_command, vec!["my-backend", "--fast"]);
        assert!(agent.classifier_command.is_empty());
        assert!(AgentConfig::default().collaborators().is_err());
    }

    #[tokio::test]
    async fn test_command_backend_round_trip() {
        let backend = CommandBackend {
            argv: sh(r#"cat > /dev/null; echo '{"model":"ext","text":"ok","cost":"0.25"}'"#),
        };
        let task = vigil::Task::new(TaskKind::User, json!("hi"), TaskOrigin::Owner).unwrap();
        let response = backend.call(&Context::for_task(&task, Vec::new())).await.unwrap();
        assert_eq!(response.model, "ext");
        assert_eq!(response.text, "ok");
        assert_eq!(response.cost, Decimal::new(25, 2));
    }

    #[tokio::test]
    async fn test_command_failures_map_to_backend_errors() {
        let failing = CommandBackend { argv: sh("echo nope >&2; exit 3") };
        let task = vigil::Task::new(TaskKind::User, json!("hi"), TaskOrigin::Owner).unwrap();
        let ctx = Context::for_task(&task, Vec::new());
        let err = failing.call(&ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("nope"));

        let garbled = CommandBackend { argv: sh("echo not-json") };
        assert!(matches!(garbled.call(&ctx).await, Err(BackendError::Fatal(_))));

        let unset = CommandClassifier { argv: Vec::new() };
        let action = ProposedAction::new("run_shell", json!({"cmd": "ls"}));
        assert!(matches!(unset.classify("", &action).await, Err(BackendError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_command_classifier_reads_verdict() {
        let classifier = CommandClassifier {
            argv: sh(r#"grep -q rm && echo '{"verdict":"DANGEROUS","reasoning":"deletes"}' || echo '{"verdict":"SAFE"}'"#),
        };
        let safe = classifier
            .classify("", &ProposedAction::new("run_shell", json!({"cmd": "ls"})))
            .await
            .unwrap();
        assert_eq!(safe.verdict, Verdict::Safe);
        assert_eq!(safe.model, "classifier");
        let bad = classifier
            .classify("", &ProposedAction::new("run_shell", json!({"cmd": "rm -rf x"})))
            .await
            .unwrap();
        assert_eq!(bad.verdict, Verdict::Dangerous);
        assert_eq!(bad.reasoning, "deletes");
    }
}
