//! Structural checks for a task graph.
//!
//! Returns every violation rather than stopping at the first, so an operator
//! can fix a task list in one pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::core::types::Task;

/// Validate ids, dependency references, and acyclicity.
pub fn validate_graph(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();

    for task in tasks {
        if task.id.trim().is_empty() {
            errors.push("task id must be non-empty".to_string());
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    for task in tasks {
        for dep in &task.blocked_by {
            if dep == &task.id {
                errors.push(format!("task '{}' depends on itself", task.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "task '{}' is blocked by unknown task '{}'",
                    task.id, dep
                ));
            }
        }
    }

    if errors.is_empty() {
        let cyclic = cyclic_tasks(tasks);
        if !cyclic.is_empty() {
            errors.push(format!(
                "dependency cycle among tasks: {}",
                cyclic.join(", ")
            ));
        }
    }

    errors
}

/// Ids left unsorted by Kahn's algorithm, in graph order.
fn cyclic_tasks(tasks: &[Task]) -> Vec<String> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for task in tasks {
        indegree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.blocked_by {
            *indegree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = BTreeSet::new();
    while let Some(id) = queue.pop_front() {
        sorted.insert(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    tasks
        .iter()
        .filter(|task| !sorted.contains(task.id.as_str()))
        .map(|task| task.id.clone())
        .collect()
}
