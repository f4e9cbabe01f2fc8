//! Session prompt builder for agent workers.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::outcome::Markers;
use crate::core::types::{ProjectSpec, Task, TaskStatus};

const SESSION_TEMPLATE: &str = include_str!("prompts/session.md");
const SECTION_OPEN: &str = "<!-- section:";
const SECTION_CLOSE: &str = "-->";

/// Drop order when the prompt exceeds its budget.
const DROP_ORDER: [&str; 4] = ["context", "hints", "files", "dependencies"];

/// Completion state of one dependency, shown to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// All inputs needed to build a session prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub spec: &'a ProjectSpec,
    pub workdir: String,
    pub dependencies: Vec<DependencyStatus>,
    /// Cross-task context selected for this task.
    pub context: String,
    pub markers: &'a Markers,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Builds a session prompt within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_session(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = render_session(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

fn render_session(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("session", SESSION_TEMPLATE)
        .context("load session template")?;
    let template = env.get_template("session").context("get session template")?;
    let context = input.context.trim();
    template
        .render(context! {
            project => input.spec.project.as_str(),
            summary => input.spec.summary.trim(),
            conventions => &input.spec.conventions,
            constraints => &input.spec.constraints,
            workdir => input.workdir.as_str(),
            task => input.task,
            dependencies => &input.dependencies,
            context => (!context.is_empty()).then_some(context),
            context_open => input.markers.context_open.as_str(),
            context_close => input.markers.context_close.as_str(),
            completion_marker => input.markers.completion.as_str(),
        })
        .context("render session template")
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let mut markers = Vec::new();
    let mut cursor = 0;
    while let Some(found) = rendered[cursor..].find(SECTION_OPEN) {
        let start = cursor + found;
        let body_start = start + SECTION_OPEN.len();
        let Some(close) = rendered[body_start..].find(SECTION_CLOSE) else {
            break;
        };
        let mut words = rendered[body_start..body_start + close].split_whitespace();
        let key = words.next().unwrap_or_default().to_string();
        let required = words.next() == Some("required");
        let end = body_start + close + SECTION_CLOSE.len();
        markers.push((start, end, key, required));
        cursor = end;
    }

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next = markers.get(i + 1).map_or(rendered.len(), |m| m.0);
        let content = rendered[*end..next].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over: shorten the task description section, never the contract or completion.
    let over = total_len(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    if let Some(task) = sections.iter_mut().find(|s| s.key == "task") {
        let keep = task.content.len().saturating_sub(over + 12);
        let mut cut = keep;
        while cut > 0 && !task.content.is_char_boundary(cut) {
            cut -= 1;
        }
        let before_len = task.content.len();
        task.content.truncate(cut);
        task.content.push_str("\n[truncated]");
        debug!(before_len, after_len = task.content.len(), "truncated task section for budget");
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
