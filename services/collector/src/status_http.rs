//! Local status HTTP endpoint.
//!
//! Routes:
//!   GET  /healthz                       - always 200 (process is running)
//!   GET  /readyz                        - 200 while the dispatcher runs, 503 otherwise
//!   GET  /api/v1/sessions               - per-user session state (no token values)
//!   GET  /api/v1/tasks                  - per polling unit status
//!   POST /api/v1/sessions/{email}/login - re-authenticate one user
//!
//! No authentication; bind to loopback.

use crate::dispatcher::{Dispatcher, DispatcherState, TaskStatus};
use crate::session::{AuthError, SessionStatus};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionStatus>,
}

#[derive(Debug, Serialize)]
struct TasksResponse {
    dispatcher: DispatcherState,
    capacity: usize,
    available: usize,
    tasks: Vec<TaskStatus>,
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.dispatcher.state() {
        DispatcherState::Running => (StatusCode::OK, "ready").into_response(),
        other => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("dispatcher {other:?}").to_ascii_lowercase(),
        )
            .into_response(),
    }
}

async fn get_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.dispatcher.sessions().statuses().await;
    Json(SessionsResponse { sessions })
}

async fn get_tasks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let d = &state.dispatcher;
    Json(TasksResponse {
        dispatcher: d.state(),
        capacity: d.gate().capacity(),
        available: d.gate().available(),
        tasks: d.task_statuses().await,
    })
}

async fn post_login(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    let sessions = state.dispatcher.sessions();
    match sessions.reauthenticate(&email).await {
        Ok(()) => {
            let added = match sessions.user(&email) {
                Some(user) => state.dispatcher.schedule_user(user).await,
                None => 0,
            };
            info!(email = %email, new_tasks = added, "manual re-authentication succeeded");
            (StatusCode::OK, Json(json!({ "ok": true, "new_tasks": added }))).into_response()
        }
        Err(AuthError::UnknownUser(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(email = %email, error = %e, "manual re-authentication failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/sessions", get(get_sessions))
        .route("/api/v1/tasks", get(get_tasks))
        .route("/api/v1/sessions/{email}/login", post(post_login))
        .with_state(state)
}
