//! Specification and task-list loading with schema + graph validation.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::graph::validate_graph;
use crate::core::types::{ProjectSpec, TaskList};

pub const TASK_LIST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/task_list/v1.schema.json"
));

/// A task list that parsed but violates the schema or graph invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTaskList {
    pub problems: Vec<String>,
}

impl fmt::Display for InvalidTaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task list invalid:\n- {}", self.problems.join("\n- "))
    }
}

impl std::error::Error for InvalidTaskList {}

/// Load `spec.json`.
pub fn load_spec(path: &Path) -> Result<ProjectSpec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read spec {}", path.display()))?;
    let spec: ProjectSpec = serde_json::from_str(&contents)
        .with_context(|| format!("parse spec {}", path.display()))?;
    if spec.id.trim().is_empty() {
        return Err(anyhow!("spec {}: id must be non-empty", path.display()));
    }
    Ok(spec)
}

/// Load `tasks.json`, validating schema then graph invariants.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_task_list(path: &Path) -> Result<TaskList> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task list {}", path.display()))?;
    parse_task_list(&contents).with_context(|| format!("load task list {}", path.display()))
}

pub fn parse_task_list(raw: &str) -> Result<TaskList> {
    let value: Value = serde_json::from_str(raw).context("parse task list json")?;
    let schema_problems = validate_schema(&value)?;
    if !schema_problems.is_empty() {
        return Err(InvalidTaskList {
            problems: schema_problems,
        }
        .into());
    }
    let list: TaskList = serde_json::from_value(value).context("deserialize task list")?;
    let graph_problems = validate_graph(&list.tasks);
    if !graph_problems.is_empty() {
        return Err(InvalidTaskList {
            problems: graph_problems,
        }
        .into());
    }
    debug!(tasks = list.tasks.len(), "task list loaded");
    Ok(list)
}

/// Validate against the embedded JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(TASK_LIST_SCHEMA).context("parse task list schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile task list schema: {err}"))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
