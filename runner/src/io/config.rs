//! Runner configuration stored at `<data_dir>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::outcome::{
    DEFAULT_COMPLETION_MARKER, DEFAULT_CONTEXT_CLOSE, DEFAULT_CONTEXT_OPEN,
    DEFAULT_ERROR_PATTERNS, Markers,
};
use crate::core::retry::{DEFAULT_NON_RETRYABLE, RetryPolicy};

pub const MAX_PARALLEL_RANGE: (usize, usize) = (1, 10);
pub const MAX_RETRIES_RANGE: (u32, u32) = (0, 10);

/// Runner configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Default concurrency ceiling for new runs.
    pub max_parallel: usize,

    /// Default retry budget (total attempts before a task is failed).
    pub max_retries: u32,

    /// Sleep between scheduling passes when nothing is in flight.
    pub idle_poll_ms: u64,

    /// Bound on captured init-script stdout/stderr.
    pub output_limit_bytes: usize,

    /// Downgrade successful attempts that touched none of the expected files.
    pub validate_changes: bool,

    /// Upper bound on rendered prompt size; optional sections drop first.
    pub prompt_budget_bytes: usize,

    pub agent: AgentConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub markers: MarkerConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Argv prefix; the rendered prompt is appended as the final argument.
    pub command: Vec<String>,
    /// Resolve workers without spawning processes.
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "--verbose", "--print", "--output-format", "stream-json", "-p"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Floor for the per-attempt timeout.
    pub min_task_secs: u64,
    pub init_script_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            min_task_secs: 10 * 60,
            init_script_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Base backoff, multiplied by the attempt number.
    pub backoff_ms: u64,
    /// Case-insensitive substrings that skip retry.
    pub non_retryable_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 1000,
            non_retryable_patterns: DEFAULT_NON_RETRYABLE
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarkerConfig {
    pub completion: String,
    pub context_open: String,
    pub context_close: String,
    pub error_patterns: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            completion: DEFAULT_COMPLETION_MARKER.to_string(),
            context_open: DEFAULT_CONTEXT_OPEN.to_string(),
            context_close: DEFAULT_CONTEXT_CLOSE.to_string(),
            error_patterns: DEFAULT_ERROR_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Bytes of recent context given to tasks without dependencies.
    pub tail_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { tail_bytes: 4000 }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_retries: 2,
            idle_poll_ms: 250,
            output_limit_bytes: 100_000,
            validate_changes: true,
            prompt_budget_bytes: 48_000,
            agent: AgentConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            markers: MarkerConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = MAX_PARALLEL_RANGE;
        if !(lo..=hi).contains(&self.max_parallel) {
            return Err(anyhow!("max_parallel must be within {lo}..={hi}"));
        }
        let (lo, hi) = MAX_RETRIES_RANGE;
        if !(lo..=hi).contains(&self.max_retries) {
            return Err(anyhow!("max_retries must be within {lo}..={hi}"));
        }
        if self.idle_poll_ms == 0 {
            return Err(anyhow!("idle_poll_ms must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes < 1024 {
            return Err(anyhow!("prompt_budget_bytes must be >= 1024"));
        }
        if self.timeouts.min_task_secs == 0 || self.timeouts.init_script_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if !self.agent.dry_run
            && (self.agent.command.is_empty() || self.agent.command[0].trim().is_empty())
        {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.markers.context_open.is_empty() != self.markers.context_close.is_empty() {
            return Err(anyhow!(
                "markers.context_open and markers.context_close must both be set or both empty"
            ));
        }
        Ok(())
    }

    pub fn markers(&self) -> Markers {
        Markers {
            completion: self.markers.completion.clone(),
            context_open: self.markers.context_open.clone(),
            context_close: self.markers.context_close.clone(),
            error_patterns: self.markers.error_patterns.clone(),
        }
    }

    pub fn retry_policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(self.retry.backoff_ms),
            &self.retry.non_retryable_patterns,
        )
    }

    pub fn min_task_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.min_task_secs)
    }

    pub fn init_script_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.init_script_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Clamp an operator-supplied concurrency ceiling.
pub fn clamp_max_parallel(value: usize) -> usize {
    value.clamp(MAX_PARALLEL_RANGE.0, MAX_PARALLEL_RANGE.1)
}

/// Clamp an operator-supplied retry budget.
pub fn clamp_max_retries(value: u32) -> u32 {
    value.clamp(MAX_RETRIES_RANGE.0, MAX_RETRIES_RANGE.1)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
