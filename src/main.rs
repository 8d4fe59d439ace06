use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::error::ErrorKind;
use stepflow_core::event::EventBus;
use stepflow_core::traits::SessionArchive;
use stepflow_core::types::{FlowEvent, SessionStatus};

use stepflow_agent::{
    AgentRunner, ExecutionContext, FlowController, GraphFragment, ReplayBackend, RetryingBackend,
    RunLogger, SessionOutcome, SqliteArchive,
};
use stepflow_tools::{ProcessSandbox, ToolRegistry};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Plan-graph execution engine for agent steps")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a new session
    Run {
        /// The query the session answers
        #[arg(short, long)]
        query: String,
        /// JSON file of recorded agent replies
        #[arg(short, long)]
        replies: PathBuf,
        /// Initial plan graph (JSON); skips the planning call
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Resume an archived session
    Resume {
        session_id: String,
        /// JSON file of recorded agent replies
        #[arg(short, long)]
        replies: PathBuf,
    },
    /// Print an archived session snapshot
    Show { session_id: String },
    /// List archived sessions
    Sessions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Sessions { limit } => {
            let archive = open_archive(&config)?;
            let sessions = archive.list(limit)?;
            if sessions.is_empty() {
                println!("No archived sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {:<10}  {}",
                    s.session_id,
                    s.status.to_string(),
                    s.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Show { session_id } => {
            let archive = open_archive(&config)?;
            let Some(saved) = archive.load(&session_id)? else {
                anyhow::bail!("no archived session '{}'", session_id);
            };
            let value: serde_json::Value = serde_json::from_str(&saved.snapshot)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Run {
            query,
            replies,
            plan,
        } => {
            let mut ctx = ExecutionContext::new(query)
                .with_default_max_retries(config.flow.default_max_retries);
            if let Some(path) = plan {
                let content = std::fs::read_to_string(&path)?;
                let fragment: GraphFragment = serde_json::from_str(&content)?;
                let report = ctx.seed_plan(fragment)?;
                info!(path = %path.display(), nodes = report.added.len(), "Loaded plan");
            }
            execute(&config, &replies, &mut ctx, true).await?;
        }
        Commands::Resume {
            session_id,
            replies,
        } => {
            let archive = open_archive(&config)?;
            let Some(saved) = archive.load(&session_id)? else {
                anyhow::bail!("no archived session '{}'", session_id);
            };
            if matches!(saved.status, SessionStatus::Completed | SessionStatus::Failed) {
                anyhow::bail!("session '{}' already ended as {}", session_id, saved.status);
            }
            let mut ctx = ExecutionContext::restore(&saved.snapshot)?;
            ctx.set_deadline(None);
            requeue_interrupted(&mut ctx);
            execute(&config, &replies, &mut ctx, false).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".stepflow").join("config.toml"));
    match home_config {
        Some(p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(&p)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::parse("")?)
        }
    }
}

fn open_archive(config: &AppConfig) -> anyhow::Result<SqliteArchive> {
    let path = config
        .archive_path()
        .unwrap_or_else(|| config.workspace_dir().join("sessions.db"));
    Ok(SqliteArchive::open(&path)?)
}

/// Steps cancelled by a deadline get another attempt on resume.
fn requeue_interrupted(ctx: &mut ExecutionContext) {
    let interrupted: Vec<String> = ctx
        .failed_steps()
        .iter()
        .filter(|(_, f)| f.kind == ErrorKind::Timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in interrupted {
        if let Err(e) = ctx.requeue(&id) {
            warn!(step_id = %id, error = %e, "Interrupted step stays failed");
        }
    }
}

async fn execute(
    config: &AppConfig,
    replies: &Path,
    ctx: &mut ExecutionContext,
    fresh: bool,
) -> anyhow::Result<()> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let replay = Arc::new(ReplayBackend::load(replies)?);
    let backend = Arc::new(RetryingBackend::new(replay, vec![], config.retry.clone()));
    let tools = Arc::new(ToolRegistry::with_builtins(&workspace));
    let sandbox = Arc::new(ProcessSandbox::new(&config.sandbox).with_tools(tools));
    let runner = Arc::new(AgentRunner::from_config(backend, config).with_sandbox(sandbox));

    let event_bus = Arc::new(EventBus::default());
    let archive: Arc<dyn SessionArchive> = Arc::new(open_archive(config)?);
    let cancel = CancellationToken::new();
    let controller = FlowController::new(runner, config.flow.clone(), event_bus.clone())
        .with_archive(archive)
        .with_cancel_token(cancel.clone());

    let log_stop = CancellationToken::new();
    let logger = config.log_dir().map(|log_dir| {
        tokio::spawn(RunLogger::new(log_dir).run(
            event_bus.clone(),
            ctx.session_id().clone(),
            log_stop.clone(),
        ))
    });

    let mut rx = event_bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                FlowEvent::StepStarted { step_id, role, attempt, .. } => {
                    eprintln!("[{}] {} started (attempt {})", step_id, role, attempt);
                }
                FlowEvent::StepCompleted { step_id, variant, elapsed_ms, .. } => match variant {
                    Some(v) => eprintln!("[{}] ok via variant {} ({}ms)", step_id, v, elapsed_ms),
                    None => eprintln!("[{}] ok ({}ms)", step_id, elapsed_ms),
                },
                FlowEvent::StepFailed { step_id, kind, message, will_retry, .. } => {
                    let next = if will_retry { "retrying" } else { "giving up" };
                    eprintln!("[{}] {}: {} ({})", step_id, kind, truncate(&message, 200), next);
                }
                FlowEvent::StepSkipped { step_id, cause, .. } => {
                    eprintln!("[{}] skipped: {}", step_id, cause);
                }
                FlowEvent::SessionTerminated { .. } => break,
                FlowEvent::SessionStarted { .. } => {}
            }
        }
    });

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupted, stopping session...");
        interrupt.cancel();
    });

    let session_id = ctx.session_id().clone();
    let result = if fresh {
        controller.start(ctx).await
    } else {
        controller.run(ctx).await
    };
    printer.await.ok();
    if let Some(handle) = logger {
        // The logger stops by itself after SessionTerminated.
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            log_stop.cancel();
        }
    }

    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            if outcome.status != SessionStatus::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Session {} ended as {}: {}", session_id, ctx.status(), e);
            eprintln!("Resume with: stepflow resume {} --replies <file>", session_id);
            std::process::exit(1);
        }
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    println!("Session {}: {}", outcome.session_id, outcome.status);
    if let Some(step) = &outcome.final_step {
        println!("Final step: {}", step);
    }
    println!(
        "Steps: {} completed, {} failed, {} skipped ({} dispatched, {}ms)",
        outcome.completed.len(),
        outcome.failed.len(),
        outcome.skipped.len(),
        outcome.steps_dispatched,
        outcome.elapsed_ms
    );
    println!(
        "Usage: {} input / {} output tokens",
        outcome.usage.input_tokens, outcome.usage.output_tokens
    );
    for (name, value) in &outcome.final_outputs {
        println!("  {} = {}", name, value);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
