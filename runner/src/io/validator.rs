//! Post-completion change validation.
//!
//! A cheap heuristic: if a task named the files it expected to touch and the
//! working tree changed, at least one of those files should be among the
//! changes. Absent hints or an empty diff pass.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use super::git::Git;
use crate::core::types::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
    /// Expected files with no matching change (logged, not fatal on its own).
    pub untouched: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
            untouched: Vec::new(),
        }
    }
}

/// Compare a task's expected files against the changed paths.
pub fn check_expected_files(expected: Option<&[String]>, changed: &[String]) -> ValidationReport {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return ValidationReport::valid();
    };
    if changed.is_empty() {
        return ValidationReport::valid();
    }
    let untouched: Vec<String> = expected
        .iter()
        .filter(|want| !changed.iter().any(|have| matches_file(have, want)))
        .cloned()
        .collect();
    let mut issues = Vec::new();
    if untouched.len() == expected.len() {
        issues.push(format!(
            "None of the expected files were modified: {}",
            untouched.join(", ")
        ));
    }
    ValidationReport {
        valid: issues.is_empty(),
        issues,
        untouched,
    }
}

/// Equal paths, suffix in either direction, or equal file names.
pub fn matches_file(actual: &str, expected: &str) -> bool {
    if actual == expected || actual.ends_with(expected) || expected.ends_with(actual) {
        return true;
    }
    let name = |p: &str| p.rsplit('/').next().map(str::to_string);
    name(actual) == name(expected)
}

/// Validator bound to a working directory.
#[derive(Debug, Clone)]
pub struct ChangeValidator {
    workdir: PathBuf,
}

impl ChangeValidator {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Blocking: shells out to git. A failing git call counts as "no changes".
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn validate(&self, task: &Task) -> ValidationReport {
        if task.files_likely_touched.as_ref().is_none_or(|f| f.is_empty()) {
            return ValidationReport::valid();
        }
        let changed = match Git::new(&self.workdir).changed_files() {
            Ok(changed) => changed,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "git diff unavailable, skipping validation");
                Vec::new()
            }
        };
        let report = check_expected_files(task.files_likely_touched.as_deref(), &changed);
        if report.valid && !report.untouched.is_empty() {
            info!(untouched = %report.untouched.join(", "), "partial match of expected files");
        }
        report
    }
}
