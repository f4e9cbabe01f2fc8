//! Starting, steering, and reconciling runs.
//!
//! Starting a run: load the spec and task list, validate the graph, create
//! the run record (uuid id, `running`), seed task states, and spawn the
//! orchestrator on the tokio runtime. The returned [`RunHandle`] is the only
//! way to pause, resume, or stop it.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::control::RunControl;
use crate::core::state_update::{
    begin_run, finalize_run, reconcile_abandoned, release_in_progress, set_run_status,
};
use crate::core::types::{Run, RunStatus, TaskList};
use crate::io::events::RunEvent;
use crate::io::init::{DataPaths, ensure_data_dirs};
use crate::io::project::{load_spec, load_task_list};
use crate::io::state_store::StateStore;
use crate::orchestrator::{Orchestrator, RunEnv, RunPlan, RunSettings, RunSummary};

/// Start failures a caller may need to tell apart (`downcast_ref`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    MissingSpec(PathBuf),
    MissingTaskList(PathBuf),
    SpecMismatch { spec_id: String, task_list_spec_id: String },
    MissingWorkdir(PathBuf),
    RunActive(String),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::MissingSpec(path) => write!(f, "spec not found at {}", path.display()),
            StartError::MissingTaskList(path) => {
                write!(f, "task list not found at {}", path.display())
            }
            StartError::SpecMismatch {
                spec_id,
                task_list_spec_id,
            } => write!(
                f,
                "task list belongs to spec '{task_list_spec_id}', not '{spec_id}'"
            ),
            StartError::MissingWorkdir(path) => {
                write!(f, "working directory {} does not exist", path.display())
            }
            StartError::RunActive(run_id) => write!(f, "run {run_id} is still active"),
        }
    }
}

impl std::error::Error for StartError {}

/// Load the task list alone (used by read-only surfaces).
pub fn read_task_list(paths: &DataPaths) -> Result<TaskList> {
    if !paths.tasks_path.exists() {
        return Err(StartError::MissingTaskList(paths.tasks_path.clone()).into());
    }
    load_task_list(&paths.tasks_path)
}

/// Load and check everything a run needs before it is created.
pub fn load_plan(paths: &DataPaths) -> Result<(RunPlan, TaskList)> {
    if !paths.spec_path.exists() {
        return Err(StartError::MissingSpec(paths.spec_path.clone()).into());
    }
    let spec = load_spec(&paths.spec_path)?;
    let list = read_task_list(paths)?;
    if list.spec_id != spec.id {
        return Err(StartError::SpecMismatch {
            spec_id: spec.id.clone(),
            task_list_spec_id: list.spec_id.clone(),
        }
        .into());
    }
    let workdir = resolve_workdir(spec.working_directory.as_deref())?;
    let plan = RunPlan {
        spec,
        tasks: list.tasks.clone(),
        workdir,
    };
    Ok((plan, list))
}

fn resolve_workdir(configured: Option<&Path>) -> Result<PathBuf> {
    let workdir = match configured {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    if !workdir.is_dir() {
        return Err(StartError::MissingWorkdir(workdir).into());
    }
    Ok(workdir)
}

/// Handle to a run executing on the runtime.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    control: Arc<RunControl>,
    task: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Pause scheduling and mirror `paused` into the store.
    pub async fn pause(&self, env: &RunEnv) -> Result<bool> {
        if !self.control.pause() {
            return Ok(false);
        }
        self.mirror_status(env, RunStatus::Paused).await?;
        env.events.emit(RunEvent::RunPaused {
            run_id: self.run_id.clone(),
        });
        Ok(true)
    }

    pub async fn resume(&self, env: &RunEnv) -> Result<bool> {
        if !self.control.resume() {
            return Ok(false);
        }
        self.mirror_status(env, RunStatus::Running).await?;
        env.events.emit(RunEvent::RunResumed {
            run_id: self.run_id.clone(),
        });
        Ok(true)
    }

    /// Request a stop; the orchestrator finalizes the run as failed.
    pub fn stop(&self) -> bool {
        self.control.stop()
    }

    /// Wait for the orchestrator to finish.
    pub async fn join(self) -> Result<RunSummary> {
        self.task.await.context("join orchestrator task")?
    }

    async fn mirror_status(&self, env: &RunEnv, status: RunStatus) -> Result<()> {
        let run_id = self.run_id.as_str();
        env.store
            .update(|state| set_run_status(state, run_id, status).map_err(anyhow::Error::msg))
            .await
            .with_context(|| format!("mark run {run_id} {status:?}"))?;
        Ok(())
    }
}

/// Create a run and spawn its orchestrator. Must be called within a tokio runtime.
///
/// Rejecting a start while another run is live is the caller's job (see
/// [`StartError::RunActive`]); this function always creates a new run.
#[instrument(skip_all, fields(data_dir = %env.paths.root.display()))]
pub async fn start_run(env: &RunEnv, settings: RunSettings) -> Result<RunHandle> {
    let (plan, _list) = load_plan(&env.paths)?;
    ensure_data_dirs(&env.paths)?;
    let settings = settings.clamped();

    let run_id = Uuid::new_v4().to_string();
    let run = Run::new(
        run_id.clone(),
        Utc::now(),
        settings.max_parallel,
        settings.max_retries,
    );
    let task_ids: Vec<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
    env.store
        .update(|state| {
            begin_run(state, run, &task_ids);
            Ok(())
        })
        .await
        .context("create run record")?;
    info!(run_id = %run_id, tasks = task_ids.len(), "run created");

    let control = Arc::new(RunControl::new(run_id.clone()));
    let orchestrator = Orchestrator::new(env.clone(), plan, control.clone(), settings);
    let task = {
        let env = env.clone();
        let control = control.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(orchestrator.run()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = format!("orchestrator panicked: {}", panic_message(&*panic));
                    error!(run_id = %control.run_id(), err = %message, "run crashed");
                    control.stop();
                    fail_crashed_run(&env, control.run_id(), &message).await;
                    Err(anyhow!(message))
                }
            }
        })
    };
    Ok(RunHandle {
        run_id,
        control,
        task,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Finalize a run whose orchestrator died so the store never shows it active.
async fn fail_crashed_run(env: &RunEnv, run_id: &str, message: &str) {
    let finalized = env
        .store
        .update(|state| {
            release_in_progress(state, run_id, message);
            finalize_run(state, run_id, false, Some(message), Utc::now())
                .map_err(anyhow::Error::msg)
        })
        .await;
    if let Err(err) = finalized {
        warn!(err = %format!("{err:#}"), "could not finalize crashed run");
    }
    env.events.emit(RunEvent::RunCompleted {
        run_id: run_id.to_string(),
        success: false,
        error: Some(message.to_string()),
    });
}

/// Fail runs left `running`/`paused` by a previous process.
///
/// `live_run_id` names the run this process still controls, if any.
pub async fn reconcile_runs(store: &StateStore, live_run_id: Option<&str>) -> Result<Vec<String>> {
    let (_, reconciled) = store
        .update(|state| Ok(reconcile_abandoned(state, live_run_id, Utc::now())))
        .await
        .context("reconcile abandoned runs")?;
    if reconciled.is_empty() {
        debug!("no abandoned runs");
    } else {
        warn!(runs = %reconciled.join(", "), "reconciled abandoned runs");
    }
    Ok(reconciled)
}

/// Error unless `list` has been approved for execution.
pub fn ensure_approved(list: &TaskList) -> Result<()> {
    if list.approved_at.is_none() {
        return Err(anyhow!("task list {} has not been approved", list.id));
    }
    Ok(())
}
