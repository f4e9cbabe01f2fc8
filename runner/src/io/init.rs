//! Data directory layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use super::config::{RunnerConfig, write_config};
use super::context::CONTEXT_HEADER;
use super::state_store::write_state;
use crate::core::types::{ProjectSpec, State, TaskList};

/// All canonical paths within a data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub logs_dir: PathBuf,
    pub state_path: PathBuf,
    pub spec_path: PathBuf,
    pub tasks_path: PathBuf,
    pub config_path: PathBuf,
    pub context_path: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            logs_dir: root.join("logs"),
            state_path: root.join("state.json"),
            spec_path: root.join("spec.json"),
            tasks_path: root.join("tasks.json"),
            config_path: root.join("config.toml"),
            context_path: root.join("context.md"),
            root,
        }
    }

    /// Per-task log file; the id is sanitized into a safe file name.
    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.logs_dir
            .join(format!("{}.log", sanitize_file_name(task_id)))
    }
}

/// Lowercase, collapse anything outside `[a-z0-9._-]` into single dashes.
pub fn sanitize_file_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            if ch == '-' && out.ends_with('-') {
                continue;
            }
            out.push(ch);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Options for `init_data_dir`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing files.
    pub force: bool,
}

/// Create the data directory with default config, empty state, and
/// placeholder spec/task list.
///
/// Fails if `state.json` already exists unless `options.force` is set.
pub fn init_data_dir(root: &Path, options: &InitOptions) -> Result<DataPaths> {
    let paths = DataPaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "runner init: {} exists but is not a directory",
            paths.root.display()
        ));
    }
    if paths.state_path.exists() && !options.force {
        return Err(anyhow!(
            "runner init: {} already exists (use --force to overwrite)",
            paths.state_path.display()
        ));
    }

    create_dir(&paths.root)?;
    create_dir(&paths.logs_dir)?;

    write_config(&paths.config_path, &RunnerConfig::default())?;
    write_state(&paths.state_path, &State::default())?;
    write_file(&paths.context_path, CONTEXT_HEADER)?;
    if options.force || !paths.spec_path.exists() {
        write_json(&paths.spec_path, &placeholder_spec())?;
    }
    if options.force || !paths.tasks_path.exists() {
        write_json(&paths.tasks_path, &placeholder_tasks())?;
    }

    debug!(root = %paths.root.display(), "data dir initialized");
    Ok(paths)
}

/// Create the directories a run writes into.
pub fn ensure_data_dirs(paths: &DataPaths) -> Result<()> {
    create_dir(&paths.root)?;
    create_dir(&paths.logs_dir)
}

fn placeholder_spec() -> ProjectSpec {
    ProjectSpec {
        id: "spec".to_string(),
        project: "Describe the project here".to_string(),
        summary: String::new(),
        conventions: Vec::new(),
        constraints: Vec::new(),
        working_directory: None,
        init_script: None,
    }
}

fn placeholder_tasks() -> TaskList {
    TaskList {
        id: "tasks".to_string(),
        spec_id: "spec".to_string(),
        tasks: Vec::new(),
        generated_at: None,
        approved_at: None,
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_file(path, &buf)
}
