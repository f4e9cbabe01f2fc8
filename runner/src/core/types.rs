//! Shared data model for tasks, runs, and the persisted state document.
//!
//! These types are the contract between the state store, the scheduler, and
//! every operator surface. Serialized field names are stable: `state.json`,
//! `tasks.json`, and `spec.json` are read by tools outside this crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status. Only `pending`, `in_progress`, `completed`, and `failed` are
/// persisted; `blocked` and `ready` are derived on read from dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal within a run: never scheduled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    Functional,
    Refactor,
    Infrastructure,
    Test,
}

/// Immutable unit of work. Defined once per run; never mutated by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub category: TaskCategory,
    /// Task ids that must reach `completed` before this task may start.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    /// Hint for the post-completion validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_likely_touched: Option<Vec<String>>,
    /// Higher is scheduled first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<f64>,
}

/// Task graph handed to a run (`tasks.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub spec_id: String,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

/// Project-level settings every agent receives (`spec.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub id: String,
    pub project: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub conventions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Shell snippet executed once before scheduling begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }
}

/// Per-task execution ledger entry, overwritten on each attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_id: String,
    pub status: TaskStatus,
    /// Spawn count; never decreases within a run.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl TaskRunRecord {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            attempt: 0,
            agent_pid: None,
            started_at: None,
            completed_at: None,
            error: None,
            log_file: None,
            context: None,
        }
    }
}

/// One execution attempt over the whole task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub max_parallel: usize,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub task_runs: Vec<TaskRunRecord>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        started_at: DateTime<Utc>,
        max_parallel: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            max_parallel,
            max_retries,
            error: None,
            task_runs: Vec::new(),
        }
    }

    pub fn task_run(&self, task_id: &str) -> Option<&TaskRunRecord> {
        self.task_runs.iter().find(|r| r.task_id == task_id)
    }

    /// Ledger entry for `task_id`, created on first use.
    pub fn task_run_mut(&mut self, task_id: &str) -> &mut TaskRunRecord {
        let idx = match self.task_runs.iter().position(|r| r.task_id == task_id) {
            Some(idx) => idx,
            None => {
                self.task_runs.push(TaskRunRecord::new(task_id));
                self.task_runs.len() - 1
            }
        };
        &mut self.task_runs[idx]
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.task_run(task_id).map_or(0, |r| r.attempt)
    }
}

/// Root of the persisted state document (`state.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub current_run_id: Option<String>,
    pub runs: Vec<Run>,
    pub task_states: BTreeMap<String, TaskStatus>,
}

impl State {
    pub fn run(&self, run_id: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == run_id)
    }

    pub fn run_mut(&mut self, run_id: &str) -> Option<&mut Run> {
        self.runs.iter_mut().find(|r| r.id == run_id)
    }

    pub fn current_run(&self) -> Option<&Run> {
        self.current_run_id.as_deref().and_then(|id| self.run(id))
    }

    /// Persisted status for a task id; unknown ids are `pending`.
    pub fn status_of(&self, task_id: &str) -> TaskStatus {
        self.task_states
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Pending)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.task_states.values().filter(|s| **s == status).count()
    }
}

/// How an agent process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Exited,
    TimedOut,
    Killed,
}

/// Structured outcome of one agent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub termination: Termination,
    pub exit_code: Option<i32>,
    /// Final outcome string reported by the agent's `result` event.
    pub result: Option<String>,
    /// Cross-task context block extracted from the agent output.
    pub context: Option<String>,
    /// Human-readable failure summary (unset on success).
    pub error: Option<String>,
}

impl AgentResult {
    pub fn success(result: Option<String>) -> Self {
        Self {
            success: true,
            termination: Termination::Exited,
            exit_code: Some(0),
            result,
            context: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            termination: Termination::Exited,
            exit_code: None,
            result: None,
            context: None,
            error: Some(error.into()),
        }
    }

    pub fn killed() -> Self {
        Self {
            termination: Termination::Killed,
            ..Self::failure("agent killed")
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}
