//! Scheduler-owned state transitions.
//!
//! Each function is applied inside a single serialized store update, so a
//! transition is never observed half-applied. Errors are plain strings naming
//! the missing run; callers wrap them with context.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::core::types::{Run, RunStatus, State, TaskStatus};

pub const ABANDONED_ERROR: &str = "abandoned after restart";

/// Install `run` as the current run and seed task states for `task_ids`.
///
/// `completed` survives across runs; `failed` and stale `in_progress` are
/// reset to `pending`; ids no longer in the task list are dropped.
pub fn begin_run(state: &mut State, run: Run, task_ids: &[String]) {
    let mut seeded = BTreeMap::new();
    for id in task_ids {
        let status = match state.status_of(id) {
            TaskStatus::Completed => TaskStatus::Completed,
            _ => TaskStatus::Pending,
        };
        seeded.insert(id.clone(), status);
    }
    state.task_states = seeded;
    state.current_run_id = Some(run.id.clone());
    state.runs.push(run);
}

/// Mark `task_id` in progress and bump its attempt counter.
///
/// Returns the new attempt number (1 for the first spawn).
pub fn begin_attempt(
    state: &mut State,
    run_id: &str,
    task_id: &str,
    started_at: DateTime<Utc>,
    log_file: Option<PathBuf>,
    agent_pid: Option<u32>,
) -> Result<u32, String> {
    let run = run_mut(state, run_id)?;
    let record = run.task_run_mut(task_id);
    record.attempt += 1;
    record.status = TaskStatus::InProgress;
    record.started_at = Some(started_at);
    record.completed_at = None;
    record.error = None;
    record.agent_pid = agent_pid;
    if log_file.is_some() {
        record.log_file = log_file;
    }
    let attempt = record.attempt;
    state
        .task_states
        .insert(task_id.to_string(), TaskStatus::InProgress);
    Ok(attempt)
}

/// Put a failed attempt back in the queue, keeping its error for operators.
pub fn requeue_attempt(
    state: &mut State,
    run_id: &str,
    task_id: &str,
    error: Option<&str>,
) -> Result<(), String> {
    let run = run_mut(state, run_id)?;
    let record = run.task_run_mut(task_id);
    record.status = TaskStatus::Pending;
    record.agent_pid = None;
    record.error = error.map(str::to_string);
    state
        .task_states
        .insert(task_id.to_string(), TaskStatus::Pending);
    Ok(())
}

/// Record the terminal outcome of a task for this run.
pub fn complete_attempt(
    state: &mut State,
    run_id: &str,
    task_id: &str,
    success: bool,
    error: Option<&str>,
    context: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<TaskStatus, String> {
    let status = if success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    let run = run_mut(state, run_id)?;
    let record = run.task_run_mut(task_id);
    record.status = status;
    record.completed_at = Some(completed_at);
    record.agent_pid = None;
    record.error = if success { None } else { error.map(str::to_string) };
    if let Some(context) = context {
        record.context = Some(context.to_string());
    }
    state.task_states.insert(task_id.to_string(), status);
    Ok(status)
}

/// Requeue every `in_progress` task of `run_id` (used when a run stops).
///
/// Returns the requeued task ids.
pub fn release_in_progress(state: &mut State, run_id: &str, reason: &str) -> Vec<String> {
    let mut released = Vec::new();
    for (id, status) in &mut state.task_states {
        if *status == TaskStatus::InProgress {
            *status = TaskStatus::Pending;
            released.push(id.clone());
        }
    }
    if let Some(run) = state.run_mut(run_id) {
        for id in &released {
            let record = run.task_run_mut(id);
            record.status = TaskStatus::Pending;
            record.agent_pid = None;
            record.error = Some(reason.to_string());
        }
    }
    released
}

/// Terminal status for the run; a terminal run is never reopened.
pub fn finalize_run(
    state: &mut State,
    run_id: &str,
    success: bool,
    error: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<(), String> {
    let run = run_mut(state, run_id)?;
    if !run.status.is_active() {
        return Ok(());
    }
    run.status = if success {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    };
    run.completed_at = Some(completed_at);
    run.error = if success { None } else { error.map(str::to_string) };
    Ok(())
}

/// Mirror a pause/resume into the run record. Terminal runs are left untouched.
pub fn set_run_status(state: &mut State, run_id: &str, status: RunStatus) -> Result<bool, String> {
    let run = run_mut(state, run_id)?;
    if !run.status.is_active() {
        return Ok(false);
    }
    run.status = status;
    Ok(true)
}

/// Fail every active run other than `live_run_id` and requeue its stuck tasks.
///
/// Returns the ids of the runs that were reconciled.
pub fn reconcile_abandoned(
    state: &mut State,
    live_run_id: Option<&str>,
    at: DateTime<Utc>,
) -> Vec<String> {
    let abandoned: Vec<String> = state
        .runs
        .iter()
        .filter(|run| run.status.is_active() && Some(run.id.as_str()) != live_run_id)
        .map(|run| run.id.clone())
        .collect();
    if abandoned.is_empty() {
        return abandoned;
    }

    for run_id in &abandoned {
        if let Some(run) = state.run_mut(run_id) {
            for record in &mut run.task_runs {
                if record.status == TaskStatus::InProgress {
                    record.status = TaskStatus::Pending;
                    record.agent_pid = None;
                    record.error = Some(ABANDONED_ERROR.to_string());
                }
            }
            run.status = RunStatus::Failed;
            run.completed_at = Some(at);
            run.error = Some(ABANDONED_ERROR.to_string());
        }
    }
    if live_run_id.is_none() {
        for status in state.task_states.values_mut() {
            if *status == TaskStatus::InProgress {
                *status = TaskStatus::Pending;
            }
        }
    }
    abandoned
}

fn run_mut<'a>(state: &'a mut State, run_id: &str) -> Result<&'a mut Run, String> {
    state
        .run_mut(run_id)
        .ok_or_else(|| format!("run '{}' not found", run_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(state: &mut State, ids: &[&str]) -> String {
        let run = Run::new("run-1", Utc::now(), 2, 2);
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        begin_run(state, run, &ids);
        "run-1".to_string()
    }

    #[test]
    fn begin_run_keeps_completed_and_resets_the_rest() {
        let mut state = State::default();
        state
            .task_states
            .insert("done".to_string(), TaskStatus::Completed);
        state.task_states.insert("bad".to_string(), TaskStatus::Failed);
        state
            .task_states
            .insert("stuck".to_string(), TaskStatus::InProgress);
        state
            .task_states
            .insert("gone".to_string(), TaskStatus::Pending);

        started(&mut state, &["done", "bad", "stuck", "new"]);

        assert_eq!(state.status_of("done"), TaskStatus::Completed);
        assert_eq!(state.status_of("bad"), TaskStatus::Pending);
        assert_eq!(state.status_of("stuck"), TaskStatus::Pending);
        assert_eq!(state.status_of("new"), TaskStatus::Pending);
        assert!(!state.task_states.contains_key("gone"));
        assert_eq!(state.current_run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn attempts_increase_across_requeues() {
        let mut state = State::default();
        let run_id = started(&mut state, &["a"]);

        let first = begin_attempt(&mut state, &run_id, "a", Utc::now(), None, Some(7)).expect("begin");
        requeue_attempt(&mut state, &run_id, "a", Some("boom")).expect("requeue");
        assert_eq!(state.status_of("a"), TaskStatus::Pending);
        let second = begin_attempt(&mut state, &run_id, "a", Utc::now(), None, None).expect("begin");

        assert_eq!((first, second), (1, 2));
        let record = state.run(&run_id).and_then(|r| r.task_run("a")).expect("record");
        assert_eq!(record.status, TaskStatus::InProgress);
        assert_eq!(record.error, None);
    }

    #[test]
    fn complete_attempt_records_terminal_status() {
        let mut state = State::default();
        let run_id = started(&mut state, &["a"]);
        begin_attempt(&mut state, &run_id, "a", Utc::now(), None, None).expect("begin");
        let status = complete_attempt(
            &mut state,
            &run_id,
            "a",
            false,
            Some("tests failed"),
            Some("notes"),
            Utc::now(),
        )
        .expect("complete");

        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(state.status_of("a"), TaskStatus::Failed);
        let record = state.run(&run_id).and_then(|r| r.task_run("a")).expect("record");
        assert_eq!(record.error.as_deref(), Some("tests failed"));
        assert_eq!(record.context.as_deref(), Some("notes"));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn finalized_run_is_not_reopened() {
        let mut state = State::default();
        let run_id = started(&mut state, &["a"]);
        finalize_run(&mut state, &run_id, false, Some("stopped by user"), Utc::now()).expect("finalize");
        assert!(!set_run_status(&mut state, &run_id, RunStatus::Running).expect("status"));
        finalize_run(&mut state, &run_id, true, None, Utc::now()).expect("finalize");

        let run = state.run(&run_id).expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("stopped by user"));
    }

    #[test]
    fn release_in_progress_requeues_running_tasks() {
        let mut state = State::default();
        let run_id = started(&mut state, &["a", "b"]);
        begin_attempt(&mut state, &run_id, "a", Utc::now(), None, None).expect("begin");

        let released = release_in_progress(&mut state, &run_id, "stopped by user");

        assert_eq!(released, vec!["a".to_string()]);
        assert_eq!(state.status_of("a"), TaskStatus::Pending);
        assert_eq!(state.run(&run_id).map(|r| r.attempts("a")), Some(1));
    }

    #[test]
    fn reconcile_fails_orphaned_runs_only() {
        let mut state = State::default();
        let run_id = started(&mut state, &["a"]);
        begin_attempt(&mut state, &run_id, "a", Utc::now(), None, None).expect("begin");

        assert!(reconcile_abandoned(&mut state, Some(&run_id), Utc::now()).is_empty());

        let reconciled = reconcile_abandoned(&mut state, None, Utc::now());
        assert_eq!(reconciled, vec![run_id.clone()]);
        let run = state.run(&run_id).expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(ABANDONED_ERROR));
        assert_eq!(state.status_of("a"), TaskStatus::Pending);
    }
}
