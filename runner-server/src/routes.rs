//! HTTP route handlers for the control API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use runner::core::readiness::derive_task_status;
use runner::core::types::{Run, State as StoreState, TaskStatus};
use runner::io::task_log::read_task_log;
use runner::orchestrator::RunSettings;
use runner::start::{RunHandle, StartError, ensure_approved, read_task_list, start_run};

use crate::error::ApiError;
use crate::sse;
use crate::state::AppState;

/// Full application: `/api/*`, `/events`, permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/tasks", get(list_tasks))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{run_id}/pause", post(pause_run))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/runs/{run_id}/stop", post(stop_run))
        .route("/logs/{task_id}", get(get_task_log))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/state - the persisted state document.
async fn get_state(State(state): State<AppState>) -> Result<Json<StoreState>, ApiError> {
    let store_state = state.env.store.read().await.map_err(|e| ApiError::internal(&e))?;
    Ok(Json(store_state))
}

#[derive(Serialize)]
struct TaskView {
    id: String,
    title: String,
    status: TaskStatus,
    blocked_by: Vec<String>,
    priority: i64,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct TasksResponse {
    task_list_id: String,
    approved: bool,
    tasks: Vec<TaskView>,
}

/// GET /api/tasks - tasks with their derived status for the current run.
async fn list_tasks(State(state): State<AppState>) -> Result<Json<TasksResponse>, ApiError> {
    let list = read_task_list(&state.env.paths).map_err(|e| ApiError::from_start(&e))?;
    let store_state = state.env.store.read().await.map_err(|e| ApiError::internal(&e))?;
    let run = store_state.current_run();

    let tasks = list
        .tasks
        .iter()
        .map(|task| {
            let record = run.and_then(|r| r.task_run(&task.id));
            TaskView {
                id: task.id.clone(),
                title: task.title.clone(),
                status: derive_task_status(task, &store_state),
                blocked_by: task.blocked_by.clone(),
                priority: task.priority,
                attempts: record.map_or(0, |r| r.attempt),
                error: record.and_then(|r| r.error.clone()),
            }
        })
        .collect();

    Ok(Json(TasksResponse {
        task_list_id: list.id,
        approved: list.approved_at.is_some(),
        tasks,
    }))
}

#[derive(Serialize)]
struct RunsResponse {
    current_run_id: Option<String>,
    /// Run this server is executing right now.
    live_run_id: Option<String>,
    runs: Vec<Run>,
}

/// GET /api/runs - run history, oldest first.
async fn list_runs(State(state): State<AppState>) -> Result<Json<RunsResponse>, ApiError> {
    let store_state = state.env.store.read().await.map_err(|e| ApiError::internal(&e))?;
    Ok(Json(RunsResponse {
        current_run_id: store_state.current_run_id,
        live_run_id: state.live_run_id().await,
        runs: store_state.runs,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartRequest {
    max_parallel: Option<usize>,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StartResponse {
    run_id: String,
}

/// POST /api/runs - start a run over the approved task list.
async fn create_run(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let mut slot = state.slot().await;
    if let Some(handle) = slot.as_ref()
        && !handle.is_finished()
    {
        let err = StartError::RunActive(handle.run_id().to_string());
        return Err(ApiError::conflict(err.to_string()));
    }

    let list = read_task_list(&state.env.paths).map_err(|e| ApiError::from_start(&e))?;
    ensure_approved(&list).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let defaults = RunSettings::from_config(&state.env.config);
    let settings = RunSettings {
        max_parallel: request.max_parallel.unwrap_or(defaults.max_parallel),
        max_retries: request.max_retries.unwrap_or(defaults.max_retries),
    };
    let handle = start_run(&state.env, settings)
        .await
        .map_err(|e| ApiError::from_start(&e))?;
    let run_id = handle.run_id().to_string();
    info!(run_id = %run_id, "run started via api");
    *slot = Some(handle);
    Ok((StatusCode::CREATED, Json(StartResponse { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlResponse {
    run_id: String,
    /// False when the run was already in the requested state.
    changed: bool,
}

#[derive(Debug, Clone, Copy)]
enum ControlAction {
    Pause,
    Resume,
    Stop,
}

async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    control_run(&state, &run_id, ControlAction::Pause).await
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    control_run(&state, &run_id, ControlAction::Resume).await
}

async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    control_run(&state, &run_id, ControlAction::Stop).await
}

async fn control_run(
    state: &AppState,
    run_id: &str,
    action: ControlAction,
) -> Result<Json<ControlResponse>, ApiError> {
    let slot = state.slot().await;
    let handle: &RunHandle = slot
        .as_ref()
        .filter(|handle| handle.run_id() == run_id && !handle.is_finished())
        .ok_or_else(|| ApiError::not_found(format!("run {run_id} is not active")))?;

    let changed = match action {
        ControlAction::Pause => handle.pause(&state.env).await,
        ControlAction::Resume => handle.resume(&state.env).await,
        ControlAction::Stop => Ok(handle.stop()),
    }
    .map_err(|e| ApiError::internal(&e))?;
    info!(run_id = %run_id, ?action, changed, "run control");

    Ok(Json(ControlResponse {
        run_id: run_id.to_string(),
        changed,
    }))
}

/// GET /api/logs/{task_id} - plain-text log of the task's latest attempts.
async fn get_task_log(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<String, ApiError> {
    read_task_log(&state.env.paths, &task_id)
        .map_err(|e| ApiError::internal(&e))?
        .ok_or_else(|| ApiError::not_found(format!("no log for task {task_id}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use futures::StreamExt;
    use serde_json::Value;
    use tower::util::ServiceExt;

    use runner::core::types::RunStatus;
    use runner::orchestrator::RunOutcome;
    use runner::test_support::{
        ScriptedLauncher, ScriptedOutcome, TestProject, fast_config, task, task_with_deps,
    };

    use super::*;

    fn app(project: &TestProject, launcher: ScriptedLauncher) -> (AppState, Router) {
        let env = project.env(fast_config(), Arc::new(launcher));
        let state = AppState::new(env);
        (state.clone(), router(state))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Value) {
        let (status, bytes) = send(app, method, uri, body).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn join_live(state: &AppState) -> runner::orchestrator::RunSummary {
        let handle = state.slot().await.take().expect("run in slot");
        tokio::time::timeout(Duration::from_secs(10), handle.join())
            .await
            .expect("run finished")
            .expect("run ok")
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let project = TestProject::new(vec![task("a")]);
        let (_state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn start_run_executes_graph_and_exposes_results() {
        let project = TestProject::new(vec![task("a"), task_with_deps("b", &["a"])]);
        let (state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));

        let (status, body) =
            send_json(&app, "POST", "/api/runs", Some(r#"{"max_parallel":2}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let summary = join_live(&state).await;
        assert_eq!(summary.run_id, run_id);
        assert_eq!(summary.outcome, RunOutcome::Completed);

        let (status, body) = send_json(&app, "GET", "/api/tasks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], Value::Bool(true));
        let statuses: Vec<&str> = body["tasks"]
            .as_array()
            .expect("tasks")
            .iter()
            .map(|t| t["status"].as_str().expect("status"))
            .collect();
        assert_eq!(statuses, vec!["completed", "completed"]);

        let (status, body) = send_json(&app, "GET", "/api/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_run_id"], Value::String(run_id.clone()));
        assert_eq!(body["live_run_id"], Value::Null);
        assert_eq!(body["runs"][0]["status"], Value::String("completed".to_string()));
        assert_eq!(body["runs"][0]["max_parallel"], Value::from(2));

        let (status, body) = send(&app, "GET", "/api/logs/b", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("[scripted] b title"));
    }

    #[tokio::test]
    async fn start_without_body_uses_config_defaults() {
        let project = TestProject::new(vec![task("a")]);
        let (state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));

        let (status, _) = send_json(&app, "POST", "/api/runs", None).await;
        assert_eq!(status, StatusCode::CREATED);
        join_live(&state).await;

        let (_, body) = send_json(&app, "GET", "/api/state", None).await;
        let defaults = RunSettings::from_config(&fast_config());
        assert_eq!(body["runs"][0]["max_parallel"], Value::from(defaults.max_parallel));
        assert_eq!(body["task_states"]["a"], Value::String("completed".to_string()));
    }

    #[tokio::test]
    async fn second_start_while_live_conflicts_and_stop_ends_run() {
        let project = TestProject::new(vec![task("a")]);
        let launcher =
            ScriptedLauncher::new(Duration::from_millis(5)).script("a", [ScriptedOutcome::Hang]);
        let (state, app) = app(&project, launcher);

        let (status, body) = send_json(&app, "POST", "/api/runs", Some("{}")).await;
        assert_eq!(status, StatusCode::CREATED);
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let (status, body) = send_json(&app, "POST", "/api/runs", Some("{}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], Value::String("conflict".to_string()));

        let (status, body) =
            send_json(&app, "POST", &format!("/api/runs/{run_id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], Value::Bool(true));

        let summary = join_live(&state).await;
        assert_eq!(summary.outcome, RunOutcome::Stopped);
        let store_state = state.env.store.read().await.expect("read state");
        assert_eq!(
            store_state.run(&run_id).map(|r| r.status),
            Some(RunStatus::Failed)
        );
    }

    #[tokio::test]
    async fn pause_and_resume_mirror_run_status() {
        let project = TestProject::new(vec![task("a")]);
        let launcher =
            ScriptedLauncher::new(Duration::from_millis(5)).script("a", [ScriptedOutcome::Hang]);
        let (state, app) = app(&project, launcher);

        let (_, body) = send_json(&app, "POST", "/api/runs", Some("{}")).await;
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let (status, body) =
            send_json(&app, "POST", &format!("/api/runs/{run_id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], Value::Bool(true));
        let (_, body) = send_json(&app, "POST", &format!("/api/runs/{run_id}/pause"), None).await;
        assert_eq!(body["changed"], Value::Bool(false));
        let (_, body) = send_json(&app, "GET", "/api/runs", None).await;
        assert_eq!(body["runs"][0]["status"], Value::String("paused".to_string()));

        let (status, _) =
            send_json(&app, "POST", &format!("/api/runs/{run_id}/resume"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send_json(&app, "GET", "/api/runs", None).await;
        assert_eq!(body["runs"][0]["status"], Value::String("running".to_string()));

        send_json(&app, "POST", &format!("/api/runs/{run_id}/stop"), None).await;
        join_live(&state).await;
    }

    #[tokio::test]
    async fn control_of_unknown_run_is_not_found() {
        let project = TestProject::new(vec![task("a")]);
        let (_state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));
        let (status, body) = send_json(&app, "POST", "/api/runs/nope/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], Value::String("not_found".to_string()));
    }

    #[tokio::test]
    async fn unapproved_task_list_is_refused() {
        let project = TestProject::new(vec![task("a")]);
        let mut list = project.task_list();
        list.approved_at = None;
        project.write_task_list(&list);
        let launcher = ScriptedLauncher::new(Duration::from_millis(5));
        let (state, app) = app(&project, launcher.clone());

        let (status, _) = send_json(&app, "POST", "/api/runs", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.slot().await.is_none());
        assert!(launcher.spawned().is_empty());
    }

    #[tokio::test]
    async fn cyclic_task_list_reports_problems() {
        let project = TestProject::new(vec![
            task_with_deps("a", &["b"]),
            task_with_deps("b", &["a"]),
        ]);
        let (_state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));

        let (status, body) = send_json(&app, "POST", "/api/runs", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            !body["error"]["details"]["problems"]
                .as_array()
                .expect("problems")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn missing_log_is_not_found() {
        let project = TestProject::new(vec![task("a")]);
        let (_state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));
        let (status, _) = send(&app, "GET", "/api/logs/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_stream_opens_with_connected() {
        let project = TestProject::new(vec![task("a")]);
        let (_state, app) = app(&project, ScriptedLauncher::new(Duration::from_millis(5)));
        let request = Request::builder()
            .uri("/events")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("first frame")
            .expect("frame")
            .expect("bytes");
        assert!(String::from_utf8_lossy(&first).contains("event: connected"));
    }
}
