use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    adhoc,
    probe::probe_first_reachable,
    resolver::Resolver,
    scheduler::{self, SchedulerError, SharedState},
    tasks::{self, TaskContext},
};

#[derive(Clone)]
pub struct AppState {
    pub ctx: TaskContext,
    pub scheduler: SharedState,
    pub resolver: Arc<Resolver>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(status))
        .route("/api/tasks/{name}/run", post(run_task))
        .route("/api/ping", post(ping))
        .route("/api/files/info", post(file_info))
        .route("/api/files/restore", post(restore))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "orbit-vc"}))
}

#[derive(Debug, Serialize)]
struct TaskInfo {
    name: &'static str,
    description: &'static str,
}

pub async fn status(State(state): State<AppState>) -> Response {
    let registered: Vec<TaskInfo> = tasks::registry()
        .iter()
        .map(|t| TaskInfo {
            name: t.name(),
            description: t.description(),
        })
        .collect();
    let lock = state.scheduler.lock().await;
    Json(serde_json::json!({
        "running": lock.running,
        "tasks": lock.tasks,
        "registered": registered,
    }))
    .into_response()
}

pub async fn run_task(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(task) = tasks::find(&name) else {
        return (StatusCode::NOT_FOUND, format!("unknown task: {name}")).into_response();
    };

    match scheduler::run_task(&state.scheduler, task, &state.ctx).await {
        Ok(report) => Json(report).into_response(),
        Err(e @ SchedulerError::Busy(_)) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        Err(SchedulerError::Failed(e)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PingRequest {
    addresses: Vec<String>,
}

pub async fn ping(State(state): State<AppState>, Json(req): Json<PingRequest>) -> Response {
    Json(probe_first_reachable(state.ctx.pinger.as_ref(), &req.addresses).await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct FileInfoRequest {
    addresses: Vec<String>,
    path: String,
    #[serde(default)]
    dest: Option<PathBuf>,
}

pub async fn file_info(State(state): State<AppState>, Json(req): Json<FileInfoRequest>) -> Response {
    let resolver = Arc::clone(&state.resolver);
    let result = tokio::task::spawn_blocking(move || {
        adhoc::file_info(&resolver, &req.addresses, &req.path, req.dest.as_deref())
    })
    .await;
    blocking_json(result)
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    addresses: Vec<String>,
    destination: String,
    source: PathBuf,
}

pub async fn restore(State(state): State<AppState>, Json(req): Json<RestoreRequest>) -> Response {
    let resolver = Arc::clone(&state.resolver);
    let result = tokio::task::spawn_blocking(move || {
        adhoc::restore(&resolver, &req.addresses, &req.destination, &req.source)
    })
    .await;
    blocking_json(result)
}

fn blocking_json<T: Serialize>(result: Result<T, tokio::task::JoinError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            warn!(error = %e, "file operation task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Requires `Authorization: Bearer <token>` when an API token is configured.
pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.ctx.config.api_token.as_deref() else {
        return next.run(req).await;
    };
    match bearer(&req) {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
        None => (StatusCode::UNAUTHORIZED, "missing bearer").into_response(),
    }
}

fn bearer(req: &Request) -> Option<String> {
    let value = req.headers().get("Authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(ToString::to_string)
}
