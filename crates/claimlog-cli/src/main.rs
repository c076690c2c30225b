//! claimlog CLI - operator and worker interface to a claimlog branch.
//!
//! Exit codes: 0 success, 2 no work right now, 1 failure.

mod runner;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claimlog_core::app::worker_loop::Iteration;
use claimlog_core::app::{ClaimOutcome, CompletionOutcome};
use claimlog_core::config::CoordinationConfig;
use claimlog_core::domain::{BranchName, Namespace, TaskId, WorkerId};
use claimlog_core::error::ClaimError;
use claimlog_core::impls::GitSubstrate;
use claimlog_core::ports::{IdGenerator, SystemClock, UlidGenerator};
use claimlog_core::telemetry::init_tracing;
use claimlog_core::{Coordinator, CoordinatorBuilder};
use serde::Serialize;
use tracing::info;

use crate::runner::ShellRunner;

const NO_WORK: u8 = 2;

#[derive(Parser)]
#[command(name = "claimlog", about = "Leaderless task claiming over a git branch")]
struct Cli {
    /// TOML config file (CLAIMLOG_* variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local clone used to talk to the remote
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Coordination branch
    #[arg(long, global = true)]
    branch: Option<BranchName>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim the best eligible task
    Claim {
        #[arg(long)]
        worker: Option<WorkerId>,
        /// Only draw from this namespace
        #[arg(long)]
        namespace: Option<Namespace>,
        /// Offered capability (repeatable, replaces the configured set)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Renew a claim
    Heartbeat {
        #[arg(long)]
        worker: WorkerId,
        #[arg(long)]
        namespace: Namespace,
        #[arg(long)]
        task: TaskId,
    },
    /// Mark a claimed task completed
    Complete {
        #[arg(long)]
        worker: WorkerId,
        #[arg(long)]
        namespace: Namespace,
        #[arg(long)]
        task: TaskId,
        /// Commit, PR or artifact produced by the work
        #[arg(long)]
        external_ref: Option<String>,
    },
    /// One reclaim sweep over stale claims
    Reclaim {
        /// Override the configured lease timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Backlog report
    Status,
    /// Worker loop: claim, run a shell command, complete
    Run {
        #[arg(long)]
        worker: Option<WorkerId>,
        #[arg(long)]
        namespace: Option<Namespace>,
        /// Offered capability (repeatable, replaces the configured set)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        /// Stop after one task (or when there is none)
        #[arg(long)]
        once: bool,
        /// Shell command run for each task (sees CLAIMLOG_TASK_ID etc.)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Reclaim stale claims on a schedule until Ctrl-C
    Reaper,
    /// Print a fresh worker id
    WorkerId,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config =
        CoordinationConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(repo) = cli.repo {
        config.repo = Some(repo);
    }
    if let Some(branch) = cli.branch {
        config.branch = branch;
    }
    if let Command::Claim { capabilities, .. } | Command::Run { capabilities, .. } = &cli.command {
        if !capabilities.is_empty() {
            config.capabilities = capabilities.iter().cloned().collect();
        }
    }
    init_tracing(&config.log_level);

    if let Command::WorkerId = cli.command {
        println!("{}", new_worker_id());
        return Ok(ExitCode::SUCCESS);
    }

    let coordinator = connect(config)?;
    match cli.command {
        Command::Claim {
            worker, namespace, ..
        } => cmd_claim(&coordinator, worker, namespace).await,
        Command::Heartbeat {
            worker,
            namespace,
            task,
        } => {
            let renewed = coordinator.heartbeat(&namespace, &task, &worker).await?;
            print_json(&renewed)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Complete {
            worker,
            namespace,
            task,
            external_ref,
        } => {
            let outcome = coordinator
                .complete(&namespace, &task, &worker, external_ref)
                .await?;
            if let CompletionOutcome::AlreadyCompleted { by } = &outcome {
                info!(task = %task, by = %by, "task was already completed");
            }
            print_json(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reclaim { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| coordinator.config().lease_timeout());
            let report = coordinator
                .reclaim_with(timeout, coordinator.branch())
                .await?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            print_json(&coordinator.status().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            worker,
            namespace,
            once,
            command,
            ..
        } => cmd_run(&coordinator, worker, namespace, once, command.join(" ")).await,
        Command::Reaper => cmd_reaper(&coordinator).await,
        Command::WorkerId => Ok(ExitCode::SUCCESS),
    }
}

fn connect(config: CoordinationConfig) -> anyhow::Result<Coordinator> {
    let repo = match &config.repo {
        Some(repo) => repo.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let substrate = GitSubstrate::new(repo, config.remote.clone(), config.layout())
        .with_identity(config.author_name.clone(), config.author_email.clone());
    Ok(CoordinatorBuilder::new(Arc::new(substrate))
        .config(config)
        .build()?)
}

fn new_worker_id() -> WorkerId {
    UlidGenerator::new(SystemClock).generate_worker_id()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_claim(
    coordinator: &Coordinator,
    worker: Option<WorkerId>,
    namespace: Option<Namespace>,
) -> anyhow::Result<ExitCode> {
    let worker = worker.unwrap_or_else(new_worker_id);
    match coordinator.claim(&worker, namespace).await {
        Ok(ClaimOutcome::Claimed(lease)) => {
            print_json(&lease)?;
            Ok(ExitCode::SUCCESS)
        }
        Ok(ClaimOutcome::NoEligibleTask) => {
            eprintln!("no eligible task");
            Ok(ExitCode::from(NO_WORK))
        }
        // lost every race: try again later, like an empty backlog
        Err(err @ ClaimError::ExhaustedRetries { .. }) => {
            eprintln!("{err}");
            Ok(ExitCode::from(NO_WORK))
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_run(
    coordinator: &Coordinator,
    worker: Option<WorkerId>,
    namespace: Option<Namespace>,
    once: bool,
    command: String,
) -> anyhow::Result<ExitCode> {
    let worker = worker.unwrap_or_else(new_worker_id);
    let runner = Arc::new(ShellRunner::new(command));
    let worker_loop = coordinator.worker_loop(worker, namespace, runner);

    if once {
        return Ok(match worker_loop.run_once().await {
            Iteration::Completed { .. } | Iteration::AlreadyCompleted { .. } => ExitCode::SUCCESS,
            Iteration::Idle | Iteration::Contended => ExitCode::from(NO_WORK),
            Iteration::LeaseLost { task } => {
                eprintln!("lease on {task} was lost");
                ExitCode::FAILURE
            }
            Iteration::RunFailed { task, error } => {
                eprintln!("{task} failed: {error}");
                ExitCode::FAILURE
            }
            Iteration::Failed(error) => {
                eprintln!("error: {error}");
                ExitCode::FAILURE
            }
        });
    }

    let handle = worker_loop.spawn();
    let completed = handle.completed();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down worker, finishing the current task");
    handle.shutdown_and_join().await;
    info!(completed = *completed.borrow(), "tasks completed");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_reaper(coordinator: &Coordinator) -> anyhow::Result<ExitCode> {
    let reaper = coordinator.spawn_reaper();
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    reaper.shutdown().await;
    Ok(ExitCode::SUCCESS)
}
