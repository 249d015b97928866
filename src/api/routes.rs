//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::coordinator::RunRequest;
use crate::model::RunId;

const DEFAULT_PAGE: u32 = 20;
const MAX_PAGE: u32 = 100;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(trigger_run).get(list_runs))
        .route("/runs/{id}", get(run_detail).delete(delete_run))
        .route("/runs/by-correlation/{uuid}", get(run_by_correlation))
        .route("/runs/{id}/status", get(run_status))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/suites", get(list_suites))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_runs": state.coordinator.active_runs().len()
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRunRequest {
    pub suite: String,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub actor_id: i64,
    #[serde(default)]
    pub parallel: bool,
}

async fn trigger_run(
    State(state): State<AppState>,
    Json(req): Json<TriggerRunRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.suite.trim().is_empty() {
        return Err(ApiError::bad_request("suite must not be empty"));
    }
    let run = state.coordinator.run_suite(RunRequest {
        suite: req.suite,
        check: req.check.filter(|c| !c.is_empty()),
        actor_id: req.actor_id,
        parallel: req.parallel,
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": run, "meta": meta() })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = q.offset.unwrap_or(0);
    let runs = state.coordinator.list_runs(limit, offset)?;
    Ok(Json(json!({
        "data": runs,
        "meta": { "limit": limit, "offset": offset, "count": runs.len() }
    })))
}

async fn run_detail(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, ApiError> {
    let detail = state.coordinator.get_run_detail(id)?;
    Ok(Json(json!({ "data": detail })))
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, ApiError> {
    let run = state.coordinator.get_run_status(id)?;
    Ok(Json(json!({ "data": run })))
}

async fn run_by_correlation(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let run = state.coordinator.get_run_by_correlation(uuid)?;
    Ok(Json(json!({ "data": run })))
}

async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.delete_run(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.coordinator.cancel_run(id).await?;
    let run = state.coordinator.get_run_status(id)?;
    Ok(Json(json!({
        "data": { "outcome": outcome, "run": run }
    })))
}

async fn list_suites(State(state): State<AppState>) -> Json<Value> {
    let suites: Vec<Value> = state
        .coordinator
        .checks()
        .suites()
        .into_iter()
        .map(|(category, checks)| json!({ "suite": category, "checks": checks }))
        .collect();
    Json(json!({
        "data": suites,
        "meta": { "total": state.coordinator.checks().len() }
    }))
}
