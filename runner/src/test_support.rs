//! Test-only helpers: task builders, a scratch data directory, and a
//! scripted agent launcher.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use crate::core::types::{AgentResult, ProjectSpec, Task, TaskCategory, TaskList};
use crate::io::config::RunnerConfig;
use crate::io::init::{DataPaths, ensure_data_dirs};
use crate::io::worker::{AgentLauncher, AgentRequest, Worker};
use crate::orchestrator::RunEnv;

/// Create a deterministic task with default fields and no dependencies.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        phase: None,
        category: TaskCategory::Functional,
        blocked_by: Vec::new(),
        acceptance: Vec::new(),
        hints: Vec::new(),
        files_likely_touched: None,
        priority: 0,
        estimated_minutes: None,
    }
}

pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        blocked_by: deps.iter().map(|d| d.to_string()).collect(),
        ..task(id)
    }
}

pub fn task_with_priority(id: &str, priority: i64) -> Task {
    Task {
        priority,
        ..task(id)
    }
}

/// Spec with no conventions, constraints, or init script.
pub fn spec() -> ProjectSpec {
    ProjectSpec {
        id: "spec".to_string(),
        project: "Test Project".to_string(),
        summary: "A project used in tests.".to_string(),
        conventions: Vec::new(),
        constraints: Vec::new(),
        working_directory: None,
        init_script: None,
    }
}

/// Approved task list owned by [`spec`].
pub fn task_list(tasks: Vec<Task>) -> TaskList {
    TaskList {
        id: "tasks".to_string(),
        spec_id: "spec".to_string(),
        tasks,
        generated_at: None,
        approved_at: Some("2026-01-01T00:00:00Z".to_string()),
    }
}

/// Config tuned for fast tests: short backoff and polling, no git validation.
pub fn fast_config() -> RunnerConfig {
    let mut config = RunnerConfig {
        idle_poll_ms: 10,
        validate_changes: false,
        ..RunnerConfig::default()
    };
    config.retry.backoff_ms = 5;
    config
}

/// Scratch data directory with a spec, task list, and working directory.
pub struct TestProject {
    pub dir: TempDir,
    pub paths: DataPaths,
    pub workdir: PathBuf,
}

impl TestProject {
    pub fn new(tasks: Vec<Task>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::new(dir.path().join("data"));
        ensure_data_dirs(&paths).expect("data dirs");
        let workdir = dir.path().join("work");
        fs::create_dir_all(&workdir).expect("workdir");
        let project = Self {
            dir,
            paths,
            workdir,
        };
        let mut spec = spec();
        spec.working_directory = Some(project.workdir.clone());
        project.write_spec(&spec);
        project.write_task_list(&task_list(tasks));
        project
    }

    pub fn spec(&self) -> ProjectSpec {
        let raw = fs::read_to_string(&self.paths.spec_path).expect("read spec");
        serde_json::from_str(&raw).expect("parse spec")
    }

    pub fn write_spec(&self, spec: &ProjectSpec) {
        let raw = serde_json::to_string_pretty(spec).expect("serialize spec");
        fs::write(&self.paths.spec_path, raw).expect("write spec");
    }

    pub fn task_list(&self) -> TaskList {
        let raw = fs::read_to_string(&self.paths.tasks_path).expect("read task list");
        serde_json::from_str(&raw).expect("parse task list")
    }

    pub fn write_task_list(&self, list: &TaskList) {
        let raw = serde_json::to_string_pretty(list).expect("serialize task list");
        fs::write(&self.paths.tasks_path, raw).expect("write task list");
    }

    pub fn env(&self, config: RunnerConfig, launcher: Arc<dyn AgentLauncher>) -> RunEnv {
        RunEnv::with_launcher(self.paths.clone(), config, launcher)
    }
}

/// What a scripted worker does for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    SucceedWithContext(String),
    Fail(String),
    /// Never finishes on its own; resolves only when killed.
    Hang,
    /// Panics inside `spawn`, on the scheduler's task.
    PanicOnSpawn,
}

#[derive(Debug, Default)]
struct ScriptState {
    outcomes: BTreeMap<String, VecDeque<ScriptedOutcome>>,
    spawned: Vec<String>,
    prompts: BTreeMap<String, String>,
    running: usize,
    max_running: usize,
}

/// Launcher whose workers resolve to queued per-task outcomes.
///
/// A task with no queued outcome succeeds. Records spawn order, the latest
/// prompt per task, and the peak number of simultaneously running workers.
#[derive(Debug, Clone)]
pub struct ScriptedLauncher {
    delay: Duration,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedLauncher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn script(self, task_id: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        self.lock()
            .outcomes
            .entry(task_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn spawned(&self) -> Vec<String> {
        self.lock().spawned.clone()
    }

    pub fn spawn_count(&self, task_id: &str) -> usize {
        self.lock().spawned.iter().filter(|id| *id == task_id).count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.lock().max_running
    }

    pub fn prompt_for(&self, task_id: &str) -> Option<String> {
        self.lock().prompts.get(task_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn spawn(&self, request: AgentRequest) -> Result<Worker> {
        let outcome = {
            let mut state = self.lock();
            state.spawned.push(request.task_id.clone());
            state
                .prompts
                .insert(request.task_id.clone(), request.prompt.clone());
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state
                .outcomes
                .get_mut(&request.task_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ScriptedOutcome::Succeed)
        };
        if outcome == ScriptedOutcome::PanicOnSpawn {
            panic!("scripted launcher panic for {}", request.task_id);
        }

        let (worker, completer) = Worker::channel(request.task_id.clone(), None);
        let state = self.state.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            completer.emit(&format!("[scripted] {}", request.title));
            let finished = async {
                match &outcome {
                    ScriptedOutcome::Hang => std::future::pending::<()>().await,
                    _ => tokio::time::sleep(delay).await,
                }
            };
            let result = tokio::select! {
                _ = finished => match outcome {
                    ScriptedOutcome::Succeed => AgentResult::success(Some("done".to_string())),
                    ScriptedOutcome::SucceedWithContext(context) => {
                        AgentResult::success(Some("done".to_string())).with_context(context)
                    }
                    ScriptedOutcome::Fail(error) => AgentResult {
                        exit_code: Some(1),
                        ..AgentResult::failure(error)
                    },
                    ScriptedOutcome::Hang | ScriptedOutcome::PanicOnSpawn => AgentResult::killed(),
                },
                _ = completer.killed() => AgentResult::killed(),
            };
            {
                let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                state.running = state.running.saturating_sub(1);
            }
            completer.finish(result);
        });
        Ok(worker)
    }
}
