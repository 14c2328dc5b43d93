//! # loom
//!
//! Command-line front end: loads configuration, wires the provider, store and
//! tool registry together, and drives one session run per invocation.

#![deny(unsafe_code)]

mod config;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loom_core::ids::SessionId;
use loom_core::session::Session;
use loom_engine::tools::{default_registry, leaf_tools};
use loom_engine::{
    AutoApprove, AutoReject, ChannelApprover, EventEmitter, PlanApprover, SubagentManager,
    ToolRegistry, TurnEngine, TurnInput, TurnOutcome,
};
use loom_store::{Database, SessionStore, SqliteSessionStore};
use loom_telemetry::{init_telemetry, LogQuery};

use crate::config::LoomConfig;

/// Coding assistant execution engine.
#[derive(Parser, Debug)]
#[command(name = "loom", version, about = "Run coding-assistant sessions from the terminal")]
struct Cli {
    /// JSON config file (defaults to `~/.loom/config.json` when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session database, overriding the configured one.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a prompt, starting a new session or adding to an existing one.
    Run {
        prompt: String,
        /// Continue this session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        /// Working directory for a new session.
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Resume a session from its saved history without new input.
    Resume {
        session: String,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Archive a session so it can no longer run.
    Archive { session: String },
    /// Query persisted warnings and errors (needs `telemetry.log_db_path`).
    Logs {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct OutputArgs {
    /// Print every event as a JSON line instead of rendered text.
    #[arg(long)]
    json: bool,
    /// How submitted plans are answered.
    #[arg(long, value_enum, default_value_t = ApprovalMode::Ask)]
    approval: ApprovalMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ApprovalMode {
    Ask,
    Approve,
    Reject,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }

    if let Some(path) = &config.telemetry.log_db_path {
        config::ensure_parent_dir(path)?;
    }
    let telemetry = init_telemetry(config.telemetry.clone()).context("failed to initialize logging")?;

    let db_path = config.db_path();
    config::ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open session database {}", db_path.display()))?;
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db));
    info!(path = %db_path.display(), "session database opened");

    match cli.command {
        Command::Run { prompt, session, cwd, output } => {
            let session = match session {
                Some(id) => load_session(store.as_ref(), &id)?,
                None => {
                    let cwd = match cwd {
                        Some(dir) => dir,
                        None => std::env::current_dir().context("cannot resolve working directory")?,
                    };
                    Session::new(cwd)
                }
            };
            drive(&config, store, session, TurnInput::UserText(prompt), &output).await
        }
        Command::Resume { session, output } => {
            let session = load_session(store.as_ref(), &session)?;
            drive(&config, store, session, TurnInput::Continue, &output).await
        }
        Command::Sessions { limit } => {
            for summary in store.list(limit)? {
                println!(
                    "{}  {:<8} {:<8} {:>4} msgs  {}  {}",
                    summary.id,
                    format!("{:?}", summary.status).to_lowercase(),
                    format!("{:?}", summary.mode).to_lowercase(),
                    summary.message_count,
                    summary.updated_at.format("%Y-%m-%d %H:%M"),
                    summary.working_directory.display(),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Archive { session } => {
            store.archive(&SessionId::from_raw(session.clone()))?;
            println!("archived {session}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs { session, level, limit } => {
            let Some(sink) = telemetry.logs() else {
                bail!("log persistence is disabled; set telemetry.log_db_path");
            };
            let query = LogQuery {
                level,
                session_id: session,
                limit: Some(limit),
                ..LogQuery::default()
            };
            for record in sink.query(&query)? {
                println!("{} {:<5} {} {}", record.timestamp, record.level, record.target, record.message);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_session(store: &dyn SessionStore, id: &str) -> Result<Session> {
    store
        .load(&SessionId::from_raw(id))
        .with_context(|| format!("cannot load session {id}"))
}

async fn drive(
    config: &LoomConfig,
    store: Arc<dyn SessionStore>,
    mut session: Session,
    input: TurnInput,
    output: &OutputArgs,
) -> Result<ExitCode> {
    let provider = loom_llm::build_provider(&config.provider, config.retry.clone())?;
    let events = EventEmitter::new();

    let manager = SubagentManager::new(
        provider.clone(),
        ToolRegistry::from_tools(leaf_tools())?,
        store.clone(),
        events.clone(),
        config.engine.clone(),
    );
    let registry = default_registry(Arc::new(manager))?;

    let approver: Arc<dyn PlanApprover> = match output.approval {
        ApprovalMode::Approve => Arc::new(AutoApprove),
        ApprovalMode::Reject => Arc::new(AutoReject),
        ApprovalMode::Ask => {
            let (approver, requests) = ChannelApprover::new(1);
            drop(tokio::spawn(render::answer_approvals(requests)));
            Arc::new(approver)
        }
    };

    let engine = TurnEngine::new(provider, registry, store, events.clone(), config.engine.clone())
        .with_approver(approver);

    let renderer = tokio::spawn(render::render_events(
        events.subscribe(),
        engine.agent_id().clone(),
        output.json,
    ));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    }));

    info!(session_id = %session.id, "run starting");
    let outcome = engine.run(&mut session, input, &cancel).await;

    if tokio::time::timeout(Duration::from_secs(2), renderer).await.is_err() {
        warn!("event renderer did not finish");
    }
    if !output.json {
        println!();
    }
    eprintln!("session {} ({} step(s))", session.id, outcome.steps());

    Ok(match outcome {
        TurnOutcome::Completed { .. } => ExitCode::SUCCESS,
        TurnOutcome::Interrupted { .. } => ExitCode::from(130),
        TurnOutcome::Failed { kind, error, .. } => {
            eprintln!("run failed ({kind}): {error}");
            ExitCode::FAILURE
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::try_parse_from([
            "loom", "--db", "/tmp/x.db", "run", "fix the bug", "--session", "abc", "--approval", "reject", "--json",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Command::Run { prompt, session, output, .. } => {
                assert_eq!(prompt, "fix the bug");
                assert_eq!(session.as_deref(), Some("abc"));
                assert_eq!(output.approval, ApprovalMode::Reject);
                assert!(output.json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn approval_defaults_to_ask() {
        let cli = Cli::try_parse_from(["loom", "resume", "abc"]).unwrap();
        match cli.command {
            Command::Resume { output, .. } => assert_eq!(output.approval, ApprovalMode::Ask),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
