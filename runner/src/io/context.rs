//! Shared cross-task context document (`<data_dir>/context.md`).
//!
//! Append-only. Each completed task contributes one block opened by a
//! `<!-- task:ID -->` marker; workers receive the blocks of their direct
//! dependencies, or a bounded tail of recent content when they have none.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::Task;

pub const CONTEXT_HEADER: &str = "# Run Context\n\n\
Shared context for cross-task coordination. Each agent should:\n\
1. READ the sections provided in its prompt before starting\n\
2. REPORT decisions and discoveries inside the context block before finishing\n\n\
---\n";

const MARKER_OPEN: &str = "<!-- task:";
const MARKER_CLOSE: &str = "-->";

#[derive(Debug, Clone)]
pub struct ContextDocument {
    path: PathBuf,
}

impl ContextDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header if the document does not exist yet.
    pub fn init(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, CONTEXT_HEADER)
            .with_context(|| format!("write context {}", self.path.display()))
    }

    /// Append one tagged block for `task_id`.
    pub fn append(&self, task_id: &str, context: &str) -> Result<()> {
        let body = context.trim();
        if body.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open context {}", self.path.display()))?;
        write!(file, "\n<!-- task:{task_id} -->\n{body}\n")
            .with_context(|| format!("append context {}", self.path.display()))?;
        debug!(task_id, bytes = body.len(), "context appended");
        Ok(())
    }

    /// Document contents; a missing file reads as empty.
    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("read context {}", self.path.display()))
    }

    /// Context to hand a worker for `task`.
    pub fn for_task(&self, task: &Task, tail_bytes: usize) -> Result<String> {
        let content = self.read()?;
        if task.blocked_by.is_empty() {
            let body = content.strip_prefix(CONTEXT_HEADER).unwrap_or(&content);
            return Ok(tail(body, tail_bytes).trim().to_string());
        }
        let ids: Vec<&str> = task.blocked_by.iter().map(String::as_str).collect();
        Ok(sections_for(&content, &ids))
    }
}

/// Tagged blocks belonging to `task_ids`, in document order, markers kept.
pub fn sections_for(content: &str, task_ids: &[&str]) -> String {
    let markers = section_markers(content);
    let mut out = Vec::new();
    for (i, (start, id)) in markers.iter().enumerate() {
        if !task_ids.contains(id) {
            continue;
        }
        let end = markers.get(i + 1).map_or(content.len(), |(next, _)| *next);
        out.push(content[*start..end].trim().to_string());
    }
    out.join("\n\n")
}

/// Byte offset and task id of every section marker.
fn section_markers(content: &str) -> Vec<(usize, &str)> {
    let mut markers = Vec::new();
    let mut cursor = 0;
    while let Some(found) = content[cursor..].find(MARKER_OPEN) {
        let start = cursor + found;
        let id_start = start + MARKER_OPEN.len();
        let Some(close) = content[id_start..].find(MARKER_CLOSE) else {
            break;
        };
        let id = content[id_start..id_start + close].trim();
        if !id.is_empty() && !id.contains('\n') {
            markers.push((start, id));
        }
        cursor = id_start + close + MARKER_CLOSE.len();
    }
    markers
}

/// Last `max_bytes` of `content`, cut on a char boundary.
pub fn tail(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut start = content.len() - max_bytes;
    while !content.is_char_boundary(start) {
        start += 1;
    }
    &content[start..]
}
