//! Scheduling loop for one run.
//!
//! The loop is single-threaded: it spawns workers up to the concurrency
//! ceiling, waits for whichever finishes first, applies validation and retry
//! policy, and persists every transition through the serialized state store.
//! It suspends only while paused, while waiting on workers, and during
//! retry backoff.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::control::RunControl;
use crate::core::budget::task_timeout;
use crate::core::outcome::Markers;
use crate::core::readiness::{all_completed, in_progress_count, ready_tasks};
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::state_update::{
    begin_attempt, complete_attempt, finalize_run, release_in_progress, requeue_attempt,
};
use crate::core::types::{AgentResult, ProjectSpec, State, Task, TaskStatus};
use crate::io::config::{RunnerConfig, clamp_max_parallel, clamp_max_retries};
use crate::io::context::ContextDocument;
use crate::io::events::{EventSink, RunEvent};
use crate::io::init::DataPaths;
use crate::io::process::{ScriptOutcome, run_init_script};
use crate::io::prompt::{DependencyStatus, PromptBuilder, PromptInputs};
use crate::io::state_store::StateStore;
use crate::io::task_log::{append_task_log_best_effort, init_task_log};
use crate::io::validator::ChangeValidator;
use crate::io::worker::{AgentLauncher, AgentRequest, CommandLauncher, SimulatedLauncher, Worker};

pub const STOPPED_ERROR: &str = "stopped by user";
pub const FAILED_TASKS_ERROR: &str = "Some tasks failed.";

/// Shared collaborators for runs within one data directory.
#[derive(Clone)]
pub struct RunEnv {
    pub paths: DataPaths,
    pub config: Arc<RunnerConfig>,
    pub store: StateStore,
    pub events: EventSink,
    pub launcher: Arc<dyn AgentLauncher>,
}

impl RunEnv {
    /// Environment whose launcher follows `config.agent`.
    pub fn new(paths: DataPaths, config: RunnerConfig) -> Self {
        let launcher: Arc<dyn AgentLauncher> = if config.agent.dry_run {
            Arc::new(SimulatedLauncher::new(
                SimulatedLauncher::DEFAULT_DELAY,
                config.markers(),
            ))
        } else {
            Arc::new(CommandLauncher::new(
                config.agent.command.clone(),
                config.markers(),
            ))
        };
        Self::with_launcher(paths, config, launcher)
    }

    pub fn with_launcher(
        paths: DataPaths,
        config: RunnerConfig,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        let store = StateStore::new(&paths.state_path);
        Self {
            paths,
            config: Arc::new(config),
            store,
            events: EventSink::default(),
            launcher,
        }
    }
}

/// Inputs read once at run start.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub spec: ProjectSpec,
    pub tasks: Vec<Task>,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub max_parallel: usize,
    pub max_retries: u32,
}

impl RunSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_parallel: config.max_parallel,
            max_retries: config.max_retries,
        }
    }

    /// Operator values forced into their sane ranges.
    pub fn clamped(self) -> Self {
        Self {
            max_parallel: clamp_max_parallel(self.max_parallel),
            max_retries: clamp_max_retries(self.max_retries),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Stopped,
    InitFailed,
}

/// Final view of a run, read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub attempts: BTreeMap<String, u32>,
    pub task_states: BTreeMap<String, TaskStatus>,
}

impl RunSummary {
    fn from_state(run_id: &str, outcome: RunOutcome, state: &State) -> Self {
        let run = state.run(run_id);
        Self {
            run_id: run_id.to_string(),
            outcome,
            error: run.and_then(|r| r.error.clone()),
            attempts: run
                .map(|r| {
                    r.task_runs
                        .iter()
                        .map(|rec| (rec.task_id.clone(), rec.attempt))
                        .collect()
                })
                .unwrap_or_default(),
            task_states: state.task_states.clone(),
        }
    }
}

type Settled = (String, u32, AgentResult);

pub struct Orchestrator {
    env: RunEnv,
    plan: RunPlan,
    control: Arc<RunControl>,
    settings: RunSettings,
    policy: RetryPolicy,
    markers: Markers,
    context: ContextDocument,
    prompts: PromptBuilder,
    validator: ChangeValidator,
}

impl Orchestrator {
    pub fn new(env: RunEnv, plan: RunPlan, control: Arc<RunControl>, settings: RunSettings) -> Self {
        let policy = env.config.retry_policy(settings.max_retries);
        let markers = env.config.markers();
        let context = ContextDocument::new(&env.paths.context_path);
        let prompts = PromptBuilder::new(env.config.prompt_budget_bytes);
        let validator = ChangeValidator::new(&plan.workdir);
        Self {
            env,
            plan,
            control,
            settings,
            policy,
            markers,
            context,
            prompts,
            validator,
        }
    }

    fn run_id(&self) -> &str {
        self.control.run_id()
    }

    /// Drive the run to a terminal state.
    ///
    /// Store failures abort the loop: workers are killed, the run is
    /// finalized as failed if possible, and the error is returned.
    #[instrument(skip_all, fields(run_id = %self.control.run_id()))]
    pub async fn run(self) -> Result<RunSummary> {
        match self.drive().await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "run aborted");
                self.control.stop();
                let run_id = self.run_id().to_string();
                let finalized = self
                    .env
                    .store
                    .update(|state| {
                        finalize_run(state, &run_id, false, Some(&message), Utc::now())
                            .map_err(anyhow::Error::msg)
                    })
                    .await;
                if let Err(finalize_err) = finalized {
                    warn!(err = %format!("{finalize_err:#}"), "could not finalize aborted run");
                }
                self.env.events.emit(RunEvent::RunCompleted {
                    run_id,
                    success: false,
                    error: Some(message),
                });
                Err(err)
            }
        }
    }

    async fn drive(&self) -> Result<RunSummary> {
        let run_id = self.run_id().to_string();
        info!(
            tasks = self.plan.tasks.len(),
            max_parallel = self.settings.max_parallel,
            max_retries = self.settings.max_retries,
            "run started"
        );
        self.env.events.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
        });
        if let Err(err) = self.context.init() {
            warn!(err = %format!("{err:#}"), "context document unavailable");
        }

        if let Some(script) = self.plan.spec.init_script.as_deref() {
            if !script.trim().is_empty() {
                let outcome = self.run_init(script).await?;
                if self.control.is_stopping() {
                    return self.finish_stopped().await;
                }
                self.env.events.emit(RunEvent::RunInit {
                    run_id: run_id.clone(),
                    success: outcome.success,
                    error: outcome.error.clone(),
                });
                if !outcome.success {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| "init script failed".to_string());
                    warn!(err = %error, "init script failed, aborting run");
                    return self.finish(RunOutcome::InitFailed, Some(error)).await;
                }
            }
        }

        let mut active: FuturesUnordered<BoxFuture<'static, Settled>> = FuturesUnordered::new();
        loop {
            if self.control.is_stopping() {
                return self.finish_stopped().await;
            }
            if self.control.is_paused() {
                debug!("paused, waiting for resume");
                self.control.wait_for_resume().await;
                continue;
            }

            let state = self.env.store.read().await?;
            let ready: Vec<Task> = ready_tasks(&self.plan.tasks, &state)
                .into_iter()
                .cloned()
                .collect();
            let in_progress = in_progress_count(&self.plan.tasks, &state);
            if ready.is_empty() && in_progress == 0 && active.is_empty() {
                let success = all_completed(&self.plan.tasks, &state);
                return if success {
                    self.finish(RunOutcome::Completed, None).await
                } else {
                    self.finish(RunOutcome::Failed, Some(FAILED_TASKS_ERROR.to_string()))
                        .await
                };
            }

            let slots = self
                .settings
                .max_parallel
                .saturating_sub(in_progress.max(active.len()));
            for task in ready.iter().take(slots) {
                if self.control.is_stopping() {
                    break;
                }
                let (worker, attempt) = self.spawn_task(task, &state).await?;
                let task_id = task.id.clone();
                active.push(Box::pin(async move {
                    let result = worker.wait().await;
                    (task_id, attempt, result)
                }));
            }

            if active.is_empty() {
                tokio::time::sleep(self.env.config.idle_poll()).await;
                continue;
            }

            let settled = tokio::select! {
                next = active.next() => next,
                _ = self.control.stopped() => continue,
            };
            let Some((task_id, attempt, result)) = settled else {
                continue;
            };
            self.control.deregister(&task_id);
            if self.control.is_stopping() {
                debug!(task_id = %task_id, "discarding result after stop");
                continue;
            }
            self.settle(&task_id, attempt, result).await?;
        }
    }

    /// Run the init script off the runtime. A stop kills the script.
    async fn run_init(&self, script: &str) -> Result<ScriptOutcome> {
        info!("running init script");
        let script = script.to_string();
        let workdir = self.plan.workdir.clone();
        let timeout = self.env.config.init_script_timeout();
        let limit = self.env.config.output_limit_bytes;
        let cancel = Arc::new(AtomicBool::new(false));
        let mut job = {
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                run_init_script(&script, &workdir, timeout, limit, &cancel)
            })
        };
        tokio::select! {
            joined = &mut job => return joined.context("join init script"),
            _ = self.control.stopped() => {}
        }
        debug!("stop during init script, cancelling");
        cancel.store(true, Ordering::SeqCst);
        job.await.context("join init script")
    }

    /// Launch one attempt: log, prompt, worker, registry, then `in_progress`.
    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn spawn_task(&self, task: &Task, state: &State) -> Result<(Worker, u32)> {
        let run_id = self.run_id();
        let log_path = match init_task_log(&self.env.paths, &task.id) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "task log unavailable");
                None
            }
        };
        let context = self
            .context
            .for_task(task, self.env.config.context.tail_bytes)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "context unavailable for prompt");
                String::new()
            });
        let dependencies = task
            .blocked_by
            .iter()
            .map(|id| DependencyStatus {
                id: id.clone(),
                title: self
                    .plan
                    .tasks
                    .iter()
                    .find(|t| &t.id == id)
                    .map(|t| t.title.clone())
                    .unwrap_or_default(),
                status: state.status_of(id),
            })
            .collect();
        let prompt = self
            .prompts
            .build_session(&PromptInputs {
                task,
                spec: &self.plan.spec,
                workdir: self.plan.workdir.display().to_string(),
                dependencies,
                context,
                markers: &self.markers,
            })
            .with_context(|| format!("build prompt for task {}", task.id))?;

        let worker = self.env.launcher.spawn(AgentRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            workdir: self.plan.workdir.clone(),
            prompt,
            timeout: task_timeout(task.estimated_minutes, self.env.config.min_task_timeout()),
        })?;
        self.control.register(worker.clone());

        let events = self.env.events.clone();
        let task_id = task.id.clone();
        let output_log = log_path.clone();
        worker.on_output(move |line| {
            if let Some(path) = &output_log {
                append_task_log_best_effort(path, line);
            }
            events.emit(RunEvent::TaskLog {
                task_id: task_id.clone(),
                line: line.to_string(),
            });
        });

        let pid = worker.pid();
        let begun = self
            .env
            .store
            .update(|state| {
                begin_attempt(
                    state,
                    run_id,
                    &task.id,
                    Utc::now(),
                    log_path,
                    pid,
                )
                .map_err(anyhow::Error::msg)
            })
            .await
            .with_context(|| format!("mark task {} in progress", task.id));
        let attempt = match begun {
            Ok((_, attempt)) => attempt,
            Err(err) => {
                worker.kill();
                self.control.deregister(&task.id);
                return Err(err);
            }
        };

        info!(attempt, pid = ?pid, "task started");
        self.env.events.emit(RunEvent::TaskStarted {
            run_id: run_id.to_string(),
            task_id: task.id.clone(),
            attempt,
        });
        Ok((worker, attempt))
    }

    /// Validate, then either requeue with backoff or record the final outcome.
    #[instrument(skip_all, fields(task_id = %task_id, attempt = attempt))]
    async fn settle(&self, task_id: &str, attempt: u32, mut result: AgentResult) -> Result<()> {
        let run_id = self.run_id();
        let task = self
            .plan
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| anyhow!("settled unknown task {task_id}"))?;

        if result.success && self.env.config.validate_changes {
            let validator = self.validator.clone();
            let task = task.clone();
            let report = tokio::task::spawn_blocking(move || validator.validate(&task))
                .await
                .context("join change validator")?;
            if !report.valid {
                let error = format!("validation failed: {}", report.issues.join("; "));
                warn!(err = %error, "successful attempt failed validation");
                result.success = false;
                result.error = Some(error);
            }
        }

        let error = result.error.clone();
        match self.policy.decide(result.success, attempt, error.as_deref()) {
            RetryDecision::Retry { delay } => {
                self.env
                    .store
                    .update(|state| {
                        requeue_attempt(state, run_id, task_id, error.as_deref())
                            .map_err(anyhow::Error::msg)
                    })
                    .await
                    .with_context(|| format!("requeue task {task_id}"))?;
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    delay_ms,
                    err = error.as_deref().unwrap_or_default(),
                    "attempt failed, retrying"
                );
                self.env.events.emit(RunEvent::TaskRetrying {
                    run_id: run_id.to_string(),
                    task_id: task_id.to_string(),
                    attempt,
                    delay_ms,
                    error,
                });
                self.backoff(delay).await;
            }
            RetryDecision::Final => {
                let context = result
                    .context
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty());
                let (_, status) = self
                    .env
                    .store
                    .update(|state| {
                        complete_attempt(
                            state,
                            run_id,
                            task_id,
                            result.success,
                            error.as_deref(),
                            context,
                            Utc::now(),
                        )
                        .map_err(anyhow::Error::msg)
                    })
                    .await
                    .with_context(|| format!("complete task {task_id}"))?;
                if let Some(context) = context {
                    if let Err(err) = self.context.append(task_id, context) {
                        warn!(err = %format!("{err:#}"), "context append failed");
                    }
                }
                if result.success {
                    info!(status = status.as_str(), "task finished");
                } else {
                    warn!(
                        status = status.as_str(),
                        err = error.as_deref().unwrap_or_default(),
                        "task finished"
                    );
                }
                self.env.events.emit(RunEvent::TaskCompleted {
                    run_id: run_id.to_string(),
                    task_id: task_id.to_string(),
                    success: result.success,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Retry backoff; cut short by `stop`.
    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.stopped() => {}
        }
    }

    async fn finish_stopped(&self) -> Result<RunSummary> {
        let run_id = self.run_id();
        let (state, released) = self
            .env
            .store
            .update(|state| {
                let released = release_in_progress(state, run_id, STOPPED_ERROR);
                finalize_run(state, run_id, false, Some(STOPPED_ERROR), Utc::now())
                    .map_err(anyhow::Error::msg)?;
                Ok(released)
            })
            .await
            .context("finalize stopped run")?;
        info!(requeued = released.len(), "run stopped");
        self.env.events.emit(RunEvent::RunCompleted {
            run_id: run_id.to_string(),
            success: false,
            error: Some(STOPPED_ERROR.to_string()),
        });
        Ok(RunSummary::from_state(run_id, RunOutcome::Stopped, &state))
    }

    async fn finish(&self, outcome: RunOutcome, error: Option<String>) -> Result<RunSummary> {
        let run_id = self.run_id();
        let success = outcome == RunOutcome::Completed;
        let (state, ()) = self
            .env
            .store
            .update(|state| {
                finalize_run(state, run_id, success, error.as_deref(), Utc::now())
                    .map_err(anyhow::Error::msg)
            })
            .await
            .context("finalize run")?;
        info!(outcome = ?outcome, "run finished");
        self.env.events.emit(RunEvent::RunCompleted {
            run_id: run_id.to_string(),
            success,
            error,
        });
        Ok(RunSummary::from_state(run_id, outcome, &state))
    }
}
