//! Agent task run orchestrator.
//!
//! Reads a project spec and an approved task graph from the data directory
//! and executes it by dispatching each task to an external agent process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use runner::core::readiness::derive_task_status;
use runner::core::types::{Run, TaskStatus};
use runner::exit_codes;
use runner::io::config::load_config;
use runner::io::events::RunEvent;
use runner::io::init::{DataPaths, InitOptions, init_data_dir};
use runner::io::state_store::load_state;
use runner::logging;
use runner::orchestrator::{RunEnv, RunOutcome, RunSettings, RunSummary};
use runner::start::{load_plan, read_task_list, reconcile_runs, start_run};

#[derive(Parser)]
#[command(
    name = "runner",
    version,
    about = "Run orchestration engine for agent tasks"
)]
struct Cli {
    /// Data directory holding spec, task list, state, logs, and config.
    #[arg(long, global = true, env = "RUNNER_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory with default config and empty state.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check the spec and task list (schema, unknown deps, cycles).
    Validate,
    /// Execute the task graph in the foreground. Ctrl-C stops the run.
    Run {
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Use the simulated agent instead of spawning processes.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print task statuses and the current run.
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = DataPaths::new(&cli.data_dir);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Validate => cmd_validate(&paths),
        Command::Run {
            max_parallel,
            max_retries,
            dry_run,
        } => cmd_run(paths, max_parallel, max_retries, dry_run),
        Command::Status { json } => cmd_status(&paths, json),
    }
}

fn cmd_init(paths: &DataPaths, force: bool) -> Result<i32> {
    let paths = init_data_dir(&paths.root, &InitOptions { force })?;
    println!("initialized {}", paths.root.display());
    println!("edit {} and {}", paths.spec_path.display(), paths.tasks_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &DataPaths) -> Result<i32> {
    let (plan, list) = load_plan(paths)?;
    println!(
        "ok: {} tasks for spec '{}' in {}{}",
        plan.tasks.len(),
        plan.spec.id,
        plan.workdir.display(),
        if list.approved_at.is_some() { "" } else { " (not approved)" }
    );
    Ok(exit_codes::OK)
}

fn cmd_run(
    paths: DataPaths,
    max_parallel: Option<usize>,
    max_retries: Option<u32>,
    dry_run: bool,
) -> Result<i32> {
    let mut config = load_config(&paths.config_path)?;
    if dry_run {
        config.agent.dry_run = true;
    }
    let defaults = RunSettings::from_config(&config);
    let settings = RunSettings {
        max_parallel: max_parallel.unwrap_or(defaults.max_parallel),
        max_retries: max_retries.unwrap_or(defaults.max_retries),
    };
    let env = RunEnv::new(paths, config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let summary = runtime.block_on(run_foreground(env, settings))?;

    match &summary.error {
        Some(error) => println!("run {} {:?}: {error}", summary.run_id, summary.outcome),
        None => println!("run {} {:?}", summary.run_id, summary.outcome),
    }
    Ok(match summary.outcome {
        RunOutcome::Completed => exit_codes::OK,
        RunOutcome::Failed | RunOutcome::InitFailed => exit_codes::FAILED,
        RunOutcome::Stopped => exit_codes::STOPPED,
    })
}

async fn run_foreground(env: RunEnv, settings: RunSettings) -> Result<RunSummary> {
    reconcile_runs(&env.store, None).await?;
    let mut events = env.events.subscribe();
    let handle = start_run(&env, settings).await?;

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    let done = matches!(envelope.event, RunEvent::RunCompleted { .. });
                    print_event(&envelope.event);
                    if done {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let control = handle.control().clone();
    let stopper = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stopping run...");
            control.stop();
        }
    });

    let summary = handle.join().await;
    stopper.abort();
    if tokio::time::timeout(Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        warn!("event printer did not drain");
    }
    summary
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { run_id } => println!("run {run_id} started"),
        RunEvent::RunInit { success: true, .. } => println!("init script ok"),
        RunEvent::RunInit { error, .. } => {
            println!("init script failed: {}", error.as_deref().unwrap_or("unknown"))
        }
        RunEvent::RunPaused { .. } => println!("paused"),
        RunEvent::RunResumed { .. } => println!("resumed"),
        RunEvent::TaskStarted {
            task_id, attempt, ..
        } => println!("[{task_id}] started (attempt {attempt})"),
        RunEvent::TaskLog { task_id, line } => println!("[{task_id}] {line}"),
        RunEvent::TaskRetrying {
            task_id,
            attempt,
            delay_ms,
            error,
            ..
        } => println!(
            "[{task_id}] attempt {attempt} failed, retrying in {delay_ms}ms: {}",
            error.as_deref().unwrap_or("unknown error")
        ),
        RunEvent::TaskCompleted {
            task_id,
            success: true,
            ..
        } => println!("[{task_id}] completed"),
        RunEvent::TaskCompleted { task_id, error, .. } => println!(
            "[{task_id}] failed: {}",
            error.as_deref().unwrap_or("unknown error")
        ),
        RunEvent::RunCompleted { .. } => {}
    }
}

#[derive(Serialize)]
struct StatusRow {
    id: String,
    title: String,
    status: TaskStatus,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    current_run: Option<&'a Run>,
    tasks: Vec<StatusRow>,
}

fn cmd_status(paths: &DataPaths, json: bool) -> Result<i32> {
    let state = load_state(&paths.state_path)?;
    let list = read_task_list(paths)?;
    let run = state.current_run();
    let tasks: Vec<StatusRow> = list
        .tasks
        .iter()
        .map(|task| {
            let record = run.and_then(|r| r.task_run(&task.id));
            StatusRow {
                id: task.id.clone(),
                title: task.title.clone(),
                status: derive_task_status(task, &state),
                attempts: record.map_or(0, |r| r.attempt),
                error: record.and_then(|r| r.error.clone()),
            }
        })
        .collect();

    if json {
        let report = StatusReport {
            current_run: run,
            tasks,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize status")?
        );
        return Ok(exit_codes::OK);
    }

    match run {
        Some(run) => println!(
            "run {} {:?} (max_parallel={}, max_retries={})",
            run.id, run.status, run.max_parallel, run.max_retries
        ),
        None => println!("no runs yet"),
    }
    for row in &tasks {
        let error = row
            .error
            .as_deref()
            .map(|e| format!("  {}", e.lines().next().unwrap_or_default()))
            .unwrap_or_default();
        println!(
            "{:<12} {:<20} x{} {}{}",
            row.status.as_str(),
            row.id,
            row.attempts,
            row.title,
            error
        );
    }
    Ok(exit_codes::OK)
}
