//! Readiness evaluation over the task graph.
//!
//! Pure functions: callable from the scheduler and the HTTP handlers
//! concurrently without locking.

use crate::core::types::{State, Task, TaskStatus};

/// Tasks that may start now, highest priority first.
///
/// A task is ready when its persisted status is not `completed`,
/// `in_progress`, or `failed`, and every `blocked_by` id is `completed`.
/// Ties keep graph order (stable sort).
pub fn ready_tasks<'a>(tasks: &'a [Task], state: &State) -> Vec<&'a Task> {
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|task| {
            !matches!(
                state.status_of(&task.id),
                TaskStatus::Completed | TaskStatus::InProgress | TaskStatus::Failed
            )
        })
        .filter(|task| dependencies_completed(task, state))
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority));
    ready
}

pub fn dependencies_completed(task: &Task, state: &State) -> bool {
    task.blocked_by
        .iter()
        .all(|dep| state.status_of(dep) == TaskStatus::Completed)
}

/// Status as shown to operators: `pending` splits into `blocked` or `ready`.
pub fn derive_task_status(task: &Task, state: &State) -> TaskStatus {
    match state.status_of(&task.id) {
        TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Ready => {
            if dependencies_completed(task, state) {
                TaskStatus::Ready
            } else {
                TaskStatus::Blocked
            }
        }
        other => other,
    }
}

pub fn in_progress_count(tasks: &[Task], state: &State) -> usize {
    tasks
        .iter()
        .filter(|task| state.status_of(&task.id) == TaskStatus::InProgress)
        .count()
}

pub fn all_completed(tasks: &[Task], state: &State) -> bool {
    tasks
        .iter()
        .all(|task| state.status_of(&task.id) == TaskStatus::Completed)
}
