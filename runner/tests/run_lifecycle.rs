//! End-to-end run scenarios driven through `start_run` with scripted agents.
//!
//! Each test builds a scratch data directory, scripts per-task outcomes, and
//! checks the persisted state and event feed after the orchestrator finishes.

use std::sync::Arc;
use std::time::Duration;

use runner::core::types::{RunStatus, TaskStatus};
use runner::io::config::RunnerConfig;
use runner::io::events::{EventEnvelope, RunEvent};
use runner::io::project::InvalidTaskList;
use runner::io::state_store::load_state;
use runner::io::task_log::read_task_log;
use runner::orchestrator::{
    FAILED_TASKS_ERROR, RunEnv, RunOutcome, RunSettings, RunSummary, STOPPED_ERROR,
};
use runner::start::{RunHandle, reconcile_runs, start_run};
use runner::test_support::{
    ScriptedLauncher, ScriptedOutcome, TestProject, fast_config, task, task_with_deps,
    task_with_priority,
};
use tokio::sync::broadcast;

const STEP: Duration = Duration::from_millis(20);

fn settings(max_parallel: usize, max_retries: u32) -> RunSettings {
    RunSettings {
        max_parallel,
        max_retries,
    }
}

fn env_for(project: &TestProject, launcher: &ScriptedLauncher, config: RunnerConfig) -> RunEnv {
    project.env(config, Arc::new(launcher.clone()))
}

async fn finish(handle: RunHandle) -> RunSummary {
    tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("run finished in time")
        .expect("run succeeded without store errors")
}

/// Wait for the first event matching `pred`.
async fn wait_for_event<F>(rx: &mut broadcast::Receiver<EventEnvelope>, pred: F) -> RunEvent
where
    F: Fn(&RunEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.expect("event");
            if pred(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

#[tokio::test]
async fn single_task_completes_in_one_attempt() {
    let project = TestProject::new(vec![task("a")]);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(1, 2)).await.expect("start");
    let run_id = handle.run_id().to_string();
    let summary = finish(handle).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.attempts.get("a"), Some(&1));
    let state = load_state(&project.paths.state_path).expect("state");
    let run = state.run(&run_id).expect("run");
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert_eq!(state.status_of("a"), TaskStatus::Completed);
    assert_eq!(state.current_run_id.as_deref(), Some(run_id.as_str()));

    let log = read_task_log(&project.paths, "a")
        .expect("read log")
        .expect("log exists");
    assert!(log.starts_with("# Task a\n# Started "));
    assert!(log.contains("[scripted] a title"));

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::TaskStarted { task_id, attempt: 1, .. } if task_id == "a"
    )));
    assert!(events.iter().any(|e| matches!(e, RunEvent::TaskLog { .. })));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted { success: true, .. })
    ));
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_and_the_run() {
    let project = TestProject::new(vec![task("a"), task_with_deps("b", &["a"])]);
    let launcher = ScriptedLauncher::new(STEP).script(
        "b",
        [
            ScriptedOutcome::Fail("exit 1".to_string()),
            ScriptedOutcome::Fail("exit 1".to_string()),
            ScriptedOutcome::Succeed,
        ],
    );
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let summary = finish(start_run(&env, settings(1, 2)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.error.as_deref(), Some(FAILED_TASKS_ERROR));
    assert_eq!(summary.attempts.get("a"), Some(&1));
    assert_eq!(summary.attempts.get("b"), Some(&2));
    assert_eq!(summary.task_states.get("b"), Some(&TaskStatus::Failed));
    assert_eq!(launcher.spawn_count("b"), 2);

    let retries: Vec<RunEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RunEvent::TaskRetrying { .. }))
        .collect();
    assert_eq!(retries.len(), 1);
    assert!(matches!(
        &retries[0],
        RunEvent::TaskRetrying { task_id, attempt: 1, .. } if task_id == "b"
    ));

    let state = load_state(&project.paths.state_path).expect("state");
    let record = state
        .current_run()
        .and_then(|run| run.task_run("b"))
        .expect("record");
    assert_eq!(record.error.as_deref(), Some("exit 1"));
}

#[tokio::test]
async fn a_retry_can_recover_the_task() {
    let project = TestProject::new(vec![task("a")]);
    let launcher = ScriptedLauncher::new(STEP)
        .script("a", [ScriptedOutcome::Fail("flaky network".to_string())]);
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(1, 3)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.attempts.get("a"), Some(&2));
}

#[tokio::test]
async fn failed_dependency_keeps_dependents_unscheduled() {
    let project = TestProject::new(vec![
        task("a"),
        task_with_deps("b", &["a"]),
        task_with_deps("c", &["b"]),
        task("d"),
    ]);
    let launcher =
        ScriptedLauncher::new(STEP).script("a", [ScriptedOutcome::Fail("boom".to_string())]);
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(2, 1)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    let spawned = launcher.spawned();
    assert!(!spawned.contains(&"b".to_string()));
    assert!(!spawned.contains(&"c".to_string()));
    assert!(spawned.contains(&"d".to_string()));
    assert_eq!(summary.task_states.get("b"), Some(&TaskStatus::Pending));
    assert_eq!(summary.task_states.get("d"), Some(&TaskStatus::Completed));
}

#[tokio::test]
async fn concurrency_never_exceeds_max_parallel() {
    let project = TestProject::new(vec![task("a"), task("b"), task("c")]);
    let launcher = ScriptedLauncher::new(Duration::from_millis(60));
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(2, 1)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(launcher.max_concurrency(), 2);
    assert_eq!(launcher.spawned().len(), 3);
}

#[tokio::test]
async fn spawn_order_follows_priority() {
    let project = TestProject::new(vec![
        task_with_priority("low", 1),
        task_with_priority("high", 10),
        task_with_priority("mid", 5),
        task_with_priority("mid-later", 5),
    ]);
    let launcher = ScriptedLauncher::new(Duration::from_millis(5));
    let env = env_for(&project, &launcher, fast_config());

    finish(start_run(&env, settings(1, 1)).await.expect("start")).await;

    assert_eq!(launcher.spawned(), vec!["high", "mid", "mid-later", "low"]);
}

#[tokio::test]
async fn non_retryable_errors_skip_remaining_budget() {
    let project = TestProject::new(vec![task("a")]);
    let launcher = ScriptedLauncher::new(STEP).script(
        "a",
        [ScriptedOutcome::Fail("Error: Invalid API key".to_string())],
    );
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(1, 5)).await.expect("start")).await;

    assert_eq!(summary.attempts.get("a"), Some(&1));
    assert_eq!(summary.task_states.get("a"), Some(&TaskStatus::Failed));
}

#[tokio::test]
async fn stop_kills_workers_and_fails_the_run() {
    let project = TestProject::new(vec![task("a"), task("b"), task_with_deps("c", &["a"])]);
    let launcher = ScriptedLauncher::new(STEP)
        .script("a", [ScriptedOutcome::Hang])
        .script("b", [ScriptedOutcome::Hang]);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(2, 2)).await.expect("start");
    // Both start in the same pass; `b` is spawned after `a`.
    wait_for_event(&mut rx, |e| {
        matches!(e, RunEvent::TaskStarted { task_id, .. } if task_id == "b")
    })
    .await;
    assert_eq!(handle.control().active_count(), 2);
    assert!(handle.stop());
    assert!(!handle.stop());
    let summary = finish(handle).await;

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.error.as_deref(), Some(STOPPED_ERROR));
    assert_eq!(summary.task_states.get("a"), Some(&TaskStatus::Pending));
    assert_eq!(summary.task_states.get("b"), Some(&TaskStatus::Pending));
    assert!(!launcher.spawned().contains(&"c".to_string()));

    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(
        state.current_run().map(|r| r.status),
        Some(RunStatus::Failed)
    );
}

#[tokio::test]
async fn pause_holds_scheduling_until_resume() {
    let project = TestProject::new(vec![task_with_priority("a", 2), task_with_priority("b", 1)]);
    let launcher = ScriptedLauncher::new(Duration::from_millis(50));
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(1, 1)).await.expect("start");
    wait_for_event(&mut rx, |e| matches!(e, RunEvent::TaskStarted { .. })).await;
    assert!(handle.pause(&env).await.expect("pause"));
    assert!(!handle.pause(&env).await.expect("second pause"));

    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(state.current_run().map(|r| r.status), Some(RunStatus::Paused));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(launcher.spawned(), vec!["a"]);

    assert!(handle.resume(&env).await.expect("resume"));
    let summary = finish(handle).await;
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(launcher.spawned(), vec!["a", "b"]);
}

#[tokio::test]
async fn stop_while_paused_finalizes_the_run() {
    let project = TestProject::new(vec![task("a"), task_with_deps("b", &["a"])]);
    let launcher = ScriptedLauncher::new(Duration::from_millis(30));
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(1, 1)).await.expect("start");
    wait_for_event(&mut rx, |e| matches!(e, RunEvent::TaskStarted { .. })).await;
    handle.pause(&env).await.expect("pause");
    handle.stop();
    let summary = finish(handle).await;

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(state.current_run().map(|r| r.status), Some(RunStatus::Failed));
}

#[tokio::test]
async fn dependents_receive_context_from_completed_tasks() {
    let project = TestProject::new(vec![task("a"), task_with_deps("b", &["a"])]);
    let launcher = ScriptedLauncher::new(STEP).script(
        "a",
        [ScriptedOutcome::SucceedWithContext(
            "schema uses uuid primary keys".to_string(),
        )],
    );
    let env = env_for(&project, &launcher, fast_config());

    finish(start_run(&env, settings(1, 1)).await.expect("start")).await;

    let prompt = launcher.prompt_for("b").expect("prompt for b");
    assert!(prompt.contains("schema uses uuid primary keys"));
    assert!(prompt.contains("- a (a title): completed"));
    let context = std::fs::read_to_string(&project.paths.context_path).expect("context");
    assert!(context.contains("<!-- task:a -->\nschema uses uuid primary keys"));

    let state = load_state(&project.paths.state_path).expect("state");
    let record = state
        .current_run()
        .and_then(|run| run.task_run("a"))
        .expect("record");
    assert_eq!(record.context.as_deref(), Some("schema uses uuid primary keys"));
}

#[tokio::test]
async fn failing_init_script_aborts_before_scheduling() {
    let project = TestProject::new(vec![task("a")]);
    let mut spec = project.spec();
    spec.init_script = Some("echo 'npm missing' >&2; exit 4".to_string());
    project.write_spec(&spec);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let summary = finish(start_run(&env, settings(1, 1)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::InitFailed);
    assert!(launcher.spawned().is_empty());
    let error = summary.error.expect("error");
    assert!(error.contains("exited with 4"), "{error}");
    assert!(error.contains("npm missing"), "{error}");
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        RunEvent::RunInit { success: false, .. }
    )));
}

#[tokio::test]
async fn successful_init_script_runs_in_workdir() {
    let project = TestProject::new(vec![task("a")]);
    let mut spec = project.spec();
    spec.init_script = Some("touch initialized".to_string());
    project.write_spec(&spec);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(1, 1)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(project.workdir.join("initialized").exists());
}

#[tokio::test]
async fn stop_during_init_script_kills_it() {
    let project = TestProject::new(vec![task("a")]);
    let mut spec = project.spec();
    spec.init_script = Some("exec sleep 30".to_string());
    project.write_spec(&spec);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(1, 1)).await.expect("start");
    wait_for_event(&mut rx, |e| matches!(e, RunEvent::RunStarted { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop();
    let summary = finish(handle).await;

    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.error.as_deref(), Some(STOPPED_ERROR));
    assert!(launcher.spawned().is_empty());
    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(state.current_run().expect("run").status, RunStatus::Failed);
}

#[tokio::test]
async fn huge_estimate_does_not_crash_the_run() {
    let mut big = task("a");
    big.estimated_minutes = Some(1e300);
    let project = TestProject::new(vec![big]);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());

    let summary = finish(start_run(&env, settings(1, 1)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.attempts.get("a"), Some(&1));
}

#[tokio::test]
async fn orchestrator_panic_marks_the_run_failed() {
    let project = TestProject::new(vec![task("a")]);
    let launcher = ScriptedLauncher::new(STEP).script("a", [ScriptedOutcome::PanicOnSpawn]);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    let handle = start_run(&env, settings(1, 1)).await.expect("start");
    let run_id = handle.run_id().to_string();
    let err = tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("run finished in time")
        .expect_err("panic surfaces as an error");
    assert!(format!("{err:#}").contains("panicked"), "{err:#}");

    let state = load_state(&project.paths.state_path).expect("state");
    let run = state.run(&run_id).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.completed_at.is_some());
    assert_ne!(state.status_of("a"), TaskStatus::InProgress);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        RunEvent::RunCompleted { success: false, .. }
    )));
}

fn git(workdir: &std::path::Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(workdir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?}");
}

#[tokio::test]
async fn unrelated_changes_fail_validation_and_exhaust_retries() {
    let mut expects_a = task("a");
    expects_a.files_likely_touched = Some(vec!["src/a.rs".to_string()]);
    let project = TestProject::new(vec![expects_a]);
    let work = project.workdir.as_path();
    git(work, &["init", "-q"]);
    git(work, &["config", "user.email", "runner@example.com"]);
    git(work, &["config", "user.name", "runner"]);
    std::fs::write(work.join("README.md"), "hello\n").expect("write readme");
    git(work, &["add", "README.md"]);
    git(work, &["commit", "-q", "-m", "init"]);
    std::fs::write(work.join("notes.txt"), "scratch\n").expect("write notes");

    let launcher = ScriptedLauncher::new(STEP);
    let mut config = fast_config();
    config.validate_changes = true;
    let env = env_for(&project, &launcher, config);
    let mut rx = env.events.subscribe();

    let summary = finish(start_run(&env, settings(1, 2)).await.expect("start")).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.attempts.get("a"), Some(&2));
    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(state.status_of("a"), TaskStatus::Failed);
    let error = state
        .current_run()
        .and_then(|run| run.task_run("a"))
        .and_then(|record| record.error.clone())
        .expect("record error");
    assert!(error.starts_with("validation failed"), "{error}");
    assert!(error.contains("src/a.rs"), "{error}");

    let retries = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RunEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn cyclic_graph_is_rejected_before_a_run_exists() {
    let project = TestProject::new(vec![task("a")]);
    let mut list = project.task_list();
    list.tasks = vec![task_with_deps("x", &["y"]), task_with_deps("y", &["x"])];
    project.write_task_list(&list);
    let launcher = ScriptedLauncher::new(STEP);
    let env = env_for(&project, &launcher, fast_config());

    let err = start_run(&env, settings(1, 1)).await.expect_err("cycle");
    let invalid = err
        .downcast_ref::<InvalidTaskList>()
        .expect("typed task list error");
    assert!(invalid.problems.iter().any(|p| p.contains("cycle")));
    let state = load_state(&project.paths.state_path).expect("state");
    assert!(state.runs.is_empty());
}

#[tokio::test]
async fn next_run_keeps_completed_and_retries_failed_tasks() {
    let project = TestProject::new(vec![task("a"), task("b")]);
    let launcher =
        ScriptedLauncher::new(STEP).script("b", [ScriptedOutcome::Fail("boom".to_string())]);
    let env = env_for(&project, &launcher, fast_config());

    let first = finish(start_run(&env, settings(1, 1)).await.expect("start")).await;
    assert_eq!(first.outcome, RunOutcome::Failed);

    let second = finish(start_run(&env, settings(1, 1)).await.expect("restart")).await;
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(launcher.spawn_count("a"), 1);
    assert_eq!(launcher.spawn_count("b"), 2);
    assert_eq!(second.attempts.get("b"), Some(&1));

    let state = load_state(&project.paths.state_path).expect("state");
    assert_eq!(state.runs.len(), 2);
}

#[tokio::test]
async fn abandoned_runs_are_reconciled_at_startup() {
    let project = TestProject::new(vec![task("a")]);
    let launcher = ScriptedLauncher::new(STEP).script("a", [ScriptedOutcome::Hang]);
    let env = env_for(&project, &launcher, fast_config());
    let mut rx = env.events.subscribe();

    // Simulate a crash: the orchestrator task is dropped mid-run.
    let handle = start_run(&env, settings(1, 1)).await.expect("start");
    let run_id = handle.run_id().to_string();
    wait_for_event(&mut rx, |e| matches!(e, RunEvent::TaskStarted { .. })).await;
    drop(handle);

    let reconciled = reconcile_runs(&env.store, None).await.expect("reconcile");
    assert_eq!(reconciled, vec![run_id.clone()]);
    let state = load_state(&project.paths.state_path).expect("state");
    let run = state.run(&run_id).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("abandoned after restart"));
    assert_eq!(state.status_of("a"), TaskStatus::Pending);
}
