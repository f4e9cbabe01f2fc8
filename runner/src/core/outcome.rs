//! Classification of a finished agent process into an [`AgentResult`].

use std::time::Duration;

use regex::Regex;

use crate::core::agent_stream::{LineTail, StreamAccumulator};
use crate::core::types::{AgentResult, Termination};

pub const DEFAULT_COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
pub const DEFAULT_CONTEXT_OPEN: &str = "<run-context>";
pub const DEFAULT_CONTEXT_CLOSE: &str = "</run-context>";
pub const DEFAULT_ERROR_PATTERNS: &[&str] = &[
    "Error:",
    "error:",
    "Traceback",
    "panicked at",
    "Exception",
    "FATAL",
];

/// Number of trailing stderr lines scanned for error patterns.
pub const STDERR_SCAN_LINES: usize = 50;
const TAIL_FALLBACK_LINES: usize = 10;
const MAX_MATCHED_LINES: usize = 5;
const MAX_SUMMARY_CHARS: usize = 2000;

/// Sentinel strings the agent uses to talk back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    /// Substring of the final result that counts as success regardless of exit code.
    pub completion: String,
    pub context_open: String,
    pub context_close: String,
    /// Substrings marking a useful stderr line for failure summaries.
    pub error_patterns: Vec<String>,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            completion: DEFAULT_COMPLETION_MARKER.to_string(),
            context_open: DEFAULT_CONTEXT_OPEN.to_string(),
            context_close: DEFAULT_CONTEXT_CLOSE.to_string(),
            error_patterns: DEFAULT_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Everything observed about a process once it stopped.
#[derive(Debug)]
pub struct ProcessExit<'a> {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub timeout: Duration,
    pub stream: &'a StreamAccumulator,
    pub stderr_tail: &'a LineTail,
}

pub fn assess(exit: &ProcessExit<'_>, markers: &Markers) -> AgentResult {
    let result = exit.stream.final_result().map(str::to_string);
    let context = extract_context(exit.stream.full_output(), markers);

    let (success, error) = match exit.termination {
        Termination::Killed => (false, Some("agent killed".to_string())),
        Termination::TimedOut => (
            false,
            Some(format!(
                "agent timed out after {}s",
                exit.timeout.as_secs()
            )),
        ),
        Termination::Exited => {
            let completed = result
                .as_deref()
                .is_some_and(|r| !markers.completion.is_empty() && r.contains(&markers.completion));
            if exit.exit_code == Some(0) || completed {
                (true, None)
            } else {
                (
                    false,
                    Some(summarize_failure(
                        exit.exit_code,
                        exit.stderr_tail,
                        exit.stream.stdout_tail(),
                        &markers.error_patterns,
                    )),
                )
            }
        }
    };

    AgentResult {
        success,
        termination: exit.termination,
        exit_code: exit.exit_code,
        result,
        context,
        error,
    }
}

/// Text between the context sentinels (case-insensitive, first block), trimmed.
pub fn extract_context(output: &str, markers: &Markers) -> Option<String> {
    if markers.context_open.is_empty() || markers.context_close.is_empty() {
        return None;
    }
    let pattern = format!(
        "(?is){}(.*?){}",
        regex::escape(&markers.context_open),
        regex::escape(&markers.context_close)
    );
    let re = Regex::new(&pattern).ok()?;
    let block = re.captures(output)?.get(1)?.as_str().trim();
    (!block.is_empty()).then(|| block.to_string())
}

/// Human-readable failure text: matching stderr lines, then stderr tail,
/// then stdout tail, then a generic message.
pub fn summarize_failure(
    exit_code: Option<i32>,
    stderr_tail: &LineTail,
    stdout_tail: &LineTail,
    error_patterns: &[String],
) -> String {
    let stderr: Vec<&str> = stderr_tail.lines().collect();
    let scan_from = stderr.len().saturating_sub(STDERR_SCAN_LINES);
    let matched: Vec<&str> = stderr[scan_from..]
        .iter()
        .copied()
        .filter(|line| error_patterns.iter().any(|p| line.contains(p.as_str())))
        .collect();
    if !matched.is_empty() {
        let start = matched.len().saturating_sub(MAX_MATCHED_LINES);
        return clip(&matched[start..].join("\n"));
    }
    if let Some(tail) = non_blank_tail(&stderr) {
        return clip(&tail);
    }
    let stdout: Vec<&str> = stdout_tail.lines().collect();
    if let Some(tail) = non_blank_tail(&stdout) {
        return clip(&tail);
    }
    match exit_code {
        Some(code) => format!("agent exited with code {code}"),
        None => "agent exited without a status code".to_string(),
    }
}

fn non_blank_tail(lines: &[&str]) -> Option<String> {
    let kept: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| !line.trim().is_empty())
        .collect();
    if kept.is_empty() {
        return None;
    }
    let start = kept.len().saturating_sub(TAIL_FALLBACK_LINES);
    Some(kept[start..].join("\n"))
}

fn clip(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
