//! The operator-facing REST surface: create/inspect/patch/delete tasks and
//! read the agent registry snapshot. Kept separate from the WebSocket
//! handlers so the state-machine logic doesn't get entangled with framing.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use transcast_db::models::{NewTask, Priority, TaskStatus};
use transcast_db::queries::tasks;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(patch_task).delete(delete_task),
        )
        .route("/api/agents", get(list_agents))
        .route("/ws/agent", get(crate::ws_agent::agent_ws_handler))
        .route("/ws/observer", get(crate::ws_observer::observer_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers: tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<AppState>,
    Json(new_task): Json<NewTask>,
) -> Result<axum::response::Response, AppError> {
    let task = tasks::create(&state.pool, &new_task).await.map_err(AppError::internal)?;

    if let Err(e) = state.scheduler.try_assign().await {
        tracing::warn!(error = %e, "try_assign failed after task creation");
    }

    // Re-fetch: try_assign may have moved the task straight to ASSIGNED.
    let task = tasks::get(&state.pool, task.id)
        .await
        .map_err(AppError::internal)?
        .unwrap_or(task);

    state.connections.broadcast_assignment(&task, &state.registry).await;

    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = tasks::get(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    Ok(Json(task).into_response())
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<axum::response::Response, AppError> {
    let tasks = tasks::list(&state.pool, query.status).await.map_err(AppError::internal)?;
    Ok(Json(tasks).into_response())
}

#[derive(Debug, Deserialize)]
struct PatchTaskBody {
    priority: Option<Priority>,
    status: Option<TaskStatus>,
}

async fn patch_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchTaskBody>,
) -> Result<axum::response::Response, AppError> {
    let mut task = tasks::get(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if let Some(priority) = body.priority {
        task = tasks::update_priority(&state.pool, id, priority)
            .await
            .map_err(AppError::internal)?
            .unwrap_or(task);
    }

    let mut should_try_assign = false;

    if let Some(target) = body.status {
        task = match target {
            TaskStatus::Cancelled => tasks::cancel(&state.pool, id, true)
                .await
                .map_err(AppError::internal)?
                .ok_or_else(|| AppError::conflict(format!("task {id} is already terminal")))?,
            TaskStatus::Pending => {
                let reset = tasks::reset_to_pending(&state.pool, id)
                    .await
                    .map_err(AppError::internal)?
                    .ok_or_else(|| AppError::conflict(format!("task {id} is not FAILED")))?;
                should_try_assign = true;
                reset
            }
            other => {
                return Err(AppError::conflict(format!(
                    "cannot PATCH status to {other} directly; only CANCELLED and PENDING (from FAILED) are accepted"
                )));
            }
        };
    }

    if should_try_assign {
        if let Err(e) = state.scheduler.try_assign().await {
            tracing::warn!(error = %e, "try_assign failed after PATCH restart");
        }
        task = tasks::get(&state.pool, id)
            .await
            .map_err(AppError::internal)?
            .unwrap_or(task);
    }

    state.connections.broadcast_assignment(&task, &state.registry).await;

    Ok(Json(task).into_response())
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    match tasks::delete(&state.pool, id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(tasks::DeleteError::NotFound(_)) => Err(AppError::not_found(format!("task {id} not found"))),
        Err(e @ tasks::DeleteError::Conflict(_, _)) => Err(AppError::bad_request(e.to_string())),
        Err(tasks::DeleteError::Db(e)) => Err(AppError::internal(e.into())),
    }
}

// ---------------------------------------------------------------------------
// Handlers: agents
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AgentsResponse {
    agents: Vec<transcast_core::registry::AgentEntry>,
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    let mut agents: Vec<_> = snapshot.into_values().collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));
    Json(AgentsResponse { agents })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use sqlx::PgPool;
    use transcast_test_utils::{create_test_db, drop_test_db};

    use super::*;

    async fn send(state: AppState, method: &str, uri: &str, body: serde_json::Value) -> axum::response::Response {
        let app = super::build_router(state);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sample_task_body() -> serde_json::Value {
        json!({
            "priority": "medium",
            "input_files": [{"storage_id": "shared", "path": "in.mp4"}],
            "output_settings": {
                "storage_id": "shared",
                "path": "out.mp4",
                "codec": "h264",
                "resolution": "1920x1080"
            }
        })
    }

    async fn make_state(pool: PgPool) -> AppState {
        AppState::new(pool)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let resp = send(state.clone(), "POST", "/api/tasks", sample_task_body()).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["status"], "pending");
        let id = created["id"].as_str().unwrap();

        let resp = send(state.clone(), "GET", &format!("/api/tasks/{id}"), json!(null)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fetched = body_json(resp).await;
        assert_eq!(fetched["id"], created["id"]);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_missing_task_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let resp = send(state, "GET", &format!("/api/tasks/{}", Uuid::new_v4()), json!(null)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn patch_to_cancelled_succeeds_from_pending() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let created = body_json(send(state.clone(), "POST", "/api/tasks", sample_task_body()).await).await;
        let id = created["id"].as_str().unwrap();

        let resp = send(
            state.clone(),
            "PATCH",
            &format!("/api/tasks/{id}"),
            json!({"status": "cancelled"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let patched = body_json(resp).await;
        assert_eq!(patched["status"], "cancelled");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn patch_to_running_is_rejected() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let created = body_json(send(state.clone(), "POST", "/api/tasks", sample_task_body()).await).await;
        let id = created["id"].as_str().unwrap();

        let resp = send(
            state.clone(),
            "PATCH",
            &format!("/api/tasks/{id}"),
            json!({"status": "running"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn patch_to_pending_restarts_failed_task() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let created = body_json(send(state.clone(), "POST", "/api/tasks", sample_task_body()).await).await;
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
        tasks::assign(&pool, id, "agent-1").await.unwrap();
        tasks::fail(&pool, id, "ffmpeg crashed").await.unwrap();

        let resp = send(
            state.clone(),
            "PATCH",
            &format!("/api/tasks/{id}"),
            json!({"status": "pending"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let patched = body_json(resp).await;
        assert_eq!(patched["status"], "pending");
        assert!(patched["agent_id"].is_null());
        assert!(patched["error_message"].is_null());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn delete_rejects_in_flight_task() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        let created = body_json(send(state.clone(), "POST", "/api/tasks", sample_task_body()).await).await;
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
        tasks::assign(&pool, id, "agent-1").await.unwrap();

        let resp = send(state.clone(), "DELETE", &format!("/api/tasks/{id}"), json!(null)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn list_agents_reflects_registry_snapshot() {
        let (pool, db_name) = create_test_db().await;
        let state = make_state(pool.clone()).await;

        state
            .registry
            .upsert_online("a1", transcast_core::message::Capabilities::reference(), chrono::Utc::now())
            .await;

        let resp = send(state.clone(), "GET", "/api/agents", json!(null)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let agents = body["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["id"], "a1");

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
