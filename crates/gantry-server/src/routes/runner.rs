//! Runner protocol endpoints.
//!
//! Runners authenticate every call with the `x-runner-uuid` and
//! `x-runner-token` headers they received at registration.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use gantry_core::runner::Runner;
use gantry_core::task::{TaskDescriptor, TaskStateReport};
use gantry_core::{Status, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub const RUNNER_UUID_HEADER: &str = "x-runner-uuid";
pub const RUNNER_TOKEN_HEADER: &str = "x-runner-token";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/fetch-task", post(fetch_task))
        .route("/update-task", post(update_task))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", name)))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Runner, ApiError> {
    let uuid: Uuid = header(headers, RUNNER_UUID_HEADER)?
        .parse()
        .map_err(|_| ApiError::Unauthorized("malformed runner uuid".to_string()))?;
    let token = header(headers, RUNNER_TOKEN_HEADER)?;
    Ok(state.scheduler.runners.authenticate(uuid, token).await?)
}

#[derive(Debug, Default, Deserialize)]
struct FetchTaskRequest {
    /// Replaces the runner's declared labels when present.
    #[serde(default)]
    labels: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct FetchTaskResponse {
    task: Option<TaskDescriptor>,
}

async fn fetch_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FetchTaskRequest>,
) -> Result<Json<FetchTaskResponse>, ApiError> {
    let mut runner = authenticate(&state, &headers).await?;
    let runners = &state.scheduler.runners;
    runners.heartbeat(runner.id, false).await?;

    if let Some(labels) = req.labels {
        if labels != runner.labels {
            runners.update_labels(runner.id, &labels).await?;
            runner.labels = labels;
        }
    }

    let timeout = state.scheduler.config().poll_timeout;
    let task = state
        .scheduler
        .dispatcher
        .poll_for_task(&runner, timeout)
        .await?;
    if task.is_some() {
        runners.heartbeat(runner.id, true).await?;
    }
    Ok(Json(FetchTaskResponse { task }))
}

#[derive(Debug, Serialize)]
struct TaskState {
    id: TaskId,
    result: Status,
}

#[derive(Debug, Serialize)]
struct UpdateTaskResponse {
    state: TaskState,
}

async fn update_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<TaskStateReport>,
) -> Result<Json<UpdateTaskResponse>, ApiError> {
    let runner = authenticate(&state, &headers).await?;
    state.scheduler.runners.heartbeat(runner.id, true).await?;

    let task = state
        .scheduler
        .tasks
        .update_task_by_state(&runner, &report)
        .await?;
    Ok(Json(UpdateTaskResponse {
        state: TaskState {
            id: task.id,
            result: task.status,
        },
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use gantry_core::repository::NewRepository;
    use gantry_core::run::{JobDescriptor, NewRun};
    use gantry_core::{OwnerId, TriggerEvent, UserId};
    use gantry_db::{Database, MemoryDatabase};
    use gantry_scheduler::SchedulerConfig;
    use gantry_scheduler::runners::Registration;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::routes;

    async fn setup() -> (Router, AppState, Registration) {
        let db = Arc::new(MemoryDatabase::new());
        let mut tx = db.begin().await.unwrap();
        let repo = tx
            .insert_repository(&NewRepository {
                owner_id: OwnerId::new(1),
                owner_name: "acme".to_string(),
                name: "widgets".to_string(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let config = SchedulerConfig {
            poll_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let state = AppState::new(db, config);
        state
            .scheduler
            .runs
            .insert_run(
                &NewRun {
                    repo_id: repo.id,
                    owner_id: repo.owner_id,
                    workflow_id: "ci.kdl".to_string(),
                    trigger_user_id: UserId::new(1),
                    git_ref: "refs/heads/main".to_string(),
                    commit_sha: "abc123".to_string(),
                    event: TriggerEvent::Push,
                    trigger_event: TriggerEvent::Push,
                    event_payload: "{}".to_string(),
                    needs_approval: false,
                },
                &[JobDescriptor {
                    job_id: "build".to_string(),
                    name: "build".to_string(),
                    needs: vec![],
                    runs_on: vec!["ubuntu".to_string()],
                    payload: "{}".to_string(),
                }],
            )
            .await
            .unwrap();
        let registration = state
            .scheduler
            .runners
            .register("builder", None, None, vec![])
            .await
            .unwrap();

        (routes::router(state.clone()), state, registration)
    }

    fn post(uri: &str, reg: &Registration, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(RUNNER_UUID_HEADER, reg.runner.uuid.to_string())
            .header(RUNNER_TOKEN_HEADER, reg.token.as_str())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_and_finish_task() {
        let (app, state, reg) = setup().await;

        // No labels declared yet, so nothing matches.
        let response = app
            .clone()
            .oneshot(post("/api/actions/runner/fetch-task", &reg, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["task"].is_null());

        let response = app
            .clone()
            .oneshot(post(
                "/api/actions/runner/fetch-task",
                &reg,
                json!({ "labels": ["ubuntu"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task_id = json_body(response).await["task"]["id"].clone();
        assert!(task_id.is_number());

        let response = app
            .oneshot(post(
                "/api/actions/runner/update-task",
                &reg,
                json!({ "id": task_id, "result": "success" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"]["result"], "success");

        let runner = state.scheduler.runners.get_runner(reg.runner.id).await.unwrap();
        assert_eq!(runner.labels, vec!["ubuntu".to_string()]);
        assert!(runner.last_active.is_some_and(|t| t <= Utc::now()));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_rejected() {
        let (app, _, mut reg) = setup().await;
        reg.token = "nope".to_string();

        let response = app
            .clone()
            .oneshot(post("/api/actions/runner/fetch-task", &reg, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/api/actions/runner/fetch-task")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_final_result_is_a_bad_request() {
        let (app, _, reg) = setup().await;
        let response = app
            .clone()
            .oneshot(post(
                "/api/actions/runner/fetch-task",
                &reg,
                json!({ "labels": ["ubuntu"] }),
            ))
            .await
            .unwrap();
        let task_id = json_body(response).await["task"]["id"].clone();

        let response = app
            .oneshot(post(
                "/api/actions/runner/update-task",
                &reg,
                json!({ "id": task_id, "result": "running" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (app, _, _) = setup().await;
        for uri in ["/health", "/health/ready"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
