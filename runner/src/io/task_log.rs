//! Per-task append-only log files under `<data_dir>/logs/`.
//!
//! Product artifacts, independent of tracing. Appends are best-effort: a
//! failing log write is reported and never interrupts the task.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::warn;

use super::init::DataPaths;

/// Truncate (or create) the log for `task_id` and write its header.
pub fn init_task_log(paths: &DataPaths, task_id: &str) -> Result<PathBuf> {
    let path = paths.task_log_path(task_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let header = format!(
        "# Task {}\n# Started {}\n\n",
        task_id,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    fs::write(&path, header).with_context(|| format!("write task log {}", path.display()))?;
    Ok(path)
}

/// Append one line to a task log.
pub fn append_task_log(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open task log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append task log {}", path.display()))
}

/// Append, logging instead of failing.
pub fn append_task_log_best_effort(path: &Path, line: &str) {
    if let Err(err) = append_task_log(path, line) {
        warn!(err = %format!("{err:#}"), path = %path.display(), "task log append failed");
    }
}

/// Full log for `task_id`, or `None` if it was never started.
pub fn read_task_log(paths: &DataPaths, task_id: &str) -> Result<Option<String>> {
    let path = paths.task_log_path(task_id);
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read task log {}", path.display()))?;
    Ok(Some(contents))
}
