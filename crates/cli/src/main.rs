//! # Forge CLI
//!
//! Entry point for the orchestration pipeline: seed tasks from a codebase
//! scan, run cycles, and inspect queue state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forge_core::pipeline::PipelineController;
use forge_core::review::{CommandReviewer, ReviewCascade, ReviewStage};
use forge_core::scheduler::CycleScheduler;
use forge_core::state::{ForgeDb, TaskStatus, TaskStore};
use forge_core::tools::{
    Codebase, CommandDelivery, CommandGenerator, CommandRunner, ProcessRunner,
};
use forge_core::{AnalyzeMode, Analyzer, ForgeConfig};

#[derive(Parser)]
#[command(name = "forge", about = "Autonomous TDD task orchestration", version)]
struct Cli {
    /// Config file (JSON); missing fields take defaults
    #[arg(long, global = true, default_value = ".forge/forge.json")]
    config: PathBuf,

    /// Database path
    #[arg(long, global = true, default_value = ".forge/forge.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a codebase and seed scored, decomposed tasks
    Analyze {
        /// vision | fix | security | refactor
        #[arg(long, default_value = "fix")]
        mode: String,
        /// Codebase root to scan
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Run pipeline cycles (claim, red->green, build, review, deliver)
    Run {
        /// Stop after this many cycles; unset runs until the queue drains
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Show queue counts and recent cycles
    Status,
    /// List tasks in a given status
    Tasks {
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Show the audit trail for one task
    History { task_id: String },
    /// Put a failed task back in the queue with a fresh retry budget
    Requeue { task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        ForgeConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ForgeConfig::default()
    };

    let db = ForgeDb::open_at(&cli.db)?;
    let store = TaskStore::new(&db);

    match cli.command {
        Command::Analyze { mode, path } => {
            let mode = AnalyzeMode::parse(&mode)
                .with_context(|| format!("Unknown analyze mode '{}'", mode))?;
            let codebase = Codebase::open(&path)?.with_max_depth(config.analyze_max_depth);
            let parents = Analyzer::new(store).analyze(&codebase, mode)?;
            println!("Seeded {} tasks ({} mode):", parents.len(), mode);
            for task in parents {
                println!(
                    "  {}  [score {:.2}, complexity {}] {}",
                    task.id, task.priority, task.complexity, task.title
                );
            }
        }
        Command::Run { cycles } => {
            let controller = build_controller(store, &config);
            let stop = controller.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, stopping at the next task boundary");
                    let _ = stop.send(true);
                }
            });

            let summary = controller.run(cycles).await?;
            println!(
                "Ran {} cycles: {} promoted, {} delivered, {} failed",
                summary.cycles, summary.promoted, summary.delivered, summary.failed
            );
        }
        Command::Status => {
            let controller = build_controller(store, &config);
            let status = controller.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Tasks { status } => {
            let status = TaskStatus::parse(&status)
                .with_context(|| format!("Unknown status '{}'", status))?;
            for task in store.list_by_status(status)? {
                println!(
                    "{}  [{} | {:.2} | retries {}/{}] {}",
                    task.id,
                    task.concern,
                    task.priority,
                    task.retry_count,
                    task.max_retries,
                    task.title
                );
            }
        }
        Command::History { task_id } => {
            for entry in store.history(&task_id)? {
                println!(
                    "{}  {} -> {}  by {}{}",
                    entry.changed_at.to_rfc3339(),
                    entry
                        .from_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                    entry.to_status,
                    entry.changed_by.as_deref().unwrap_or("-"),
                    entry
                        .metadata
                        .map(|m| format!("  ({})", m))
                        .unwrap_or_default()
                );
            }
        }
        Command::Requeue { task_id } => {
            store.requeue_failed(&task_id, "operator")?;
            println!("Requeued {}", task_id);
        }
    }

    Ok(())
}

fn build_controller(store: TaskStore, config: &ForgeConfig) -> PipelineController {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new("."));

    let generator = Arc::new(CommandGenerator::new(
        Arc::clone(&runner),
        config.generate_command.clone(),
        config.task_timeout(),
    ));
    let scheduler = CycleScheduler::new(
        store.clone(),
        Arc::clone(&runner),
        generator,
        config.clone(),
    );

    let review_timeout = Duration::from_secs(config.task_timeout_secs);
    let cascade = ReviewCascade::new(
        Arc::new(CommandReviewer::new(
            Arc::clone(&runner),
            config.review_l0_command.clone(),
            ReviewStage::L0,
            review_timeout,
        )),
        Arc::new(CommandReviewer::new(
            Arc::clone(&runner),
            config.review_l1_command.clone(),
            ReviewStage::L1,
            review_timeout,
        )),
        Arc::new(CommandReviewer::new(
            Arc::clone(&runner),
            config.review_l2_command.clone(),
            ReviewStage::L2,
            review_timeout,
        )),
    )
    .with_complexity_threshold(config.l2_complexity_threshold)
    .with_retry_policy(config.review_max_attempts, config.review_backoff());

    let delivery = Arc::new(CommandDelivery::new(
        Arc::clone(&runner),
        config.commit_command.clone(),
        config.deploy_command.clone(),
        config.build_timeout(),
    ));

    PipelineController::new(store, scheduler, cascade, delivery, config.clone())
}
