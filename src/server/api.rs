//! Scheduler-facing HTTP API.
//!
//! - POST /v1/filter, /v1/score, /v1/reserve, /v1/unreserve
//! - POST /v1/events
//! - PUT /v1/records/{node}/status
//! - GET /v1/nodes/{node}
//! - GET /health, GET /metrics

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::bandwidth::Bandwidth;
use crate::cache::ledger::NodeLedger;
use crate::engine::AdmissionEngine;
use crate::events::ClusterEvent;
use crate::reservation::context::Workload;
use crate::reservation::record::StoreError;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<AdmissionEngine>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/filter", post(filter))
        .route("/v1/score", post(score))
        .route("/v1/reserve", post(reserve))
        .route("/v1/unreserve", post(unreserve))
        .route("/v1/events", post(events))
        .route("/v1/records/{node}/status", put(report_status))
        .route("/v1/nodes/{node}", get(node_ledger))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// A workload considered for a node.
#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulingRequest {
    pub node: String,
    pub workload: Workload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterResponse {
    pub node: String,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub node: String,
    pub score: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub node: String,
    pub workload: String,
    /// False when the workload needed no accounting.
    pub committed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreserveResponse {
    pub node: String,
    pub workload: String,
    pub released: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventResponse {
    pub kind: String,
    pub applied: bool,
}

/// Allocatable snapshot written by a node's reporting agent.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub allocatable: BTreeMap<String, Bandwidth>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node: String,
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub registered_nodes: usize,
    pub queued_reconciles: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn filter(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchedulingRequest>,
) -> Json<FilterResponse> {
    let result = state.engine.filter(&req.node, &req.workload);
    Json(FilterResponse {
        node: req.node,
        admitted: result.is_ok(),
        reason: result.err().map(|e| e.to_string()),
    })
}

async fn score(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchedulingRequest>,
) -> Result<Json<ScoreResponse>, ApiError> {
    let score = state
        .engine
        .score(&req.node, &req.workload)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e))?;
    Ok(Json(ScoreResponse {
        node: req.node,
        score,
    }))
}

async fn reserve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchedulingRequest>,
) -> Result<Json<ReserveResponse>, ApiError> {
    let committed = state
        .engine
        .reserve(&req.node, &req.workload)
        .map_err(|e| api_error(StatusCode::CONFLICT, e))?;

    info!(
        node = %req.node,
        workload = %req.workload.id(),
        committed,
        "Reserve request"
    );
    Ok(Json(ReserveResponse {
        workload: req.workload.id().to_string(),
        node: req.node,
        committed,
    }))
}

async fn unreserve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SchedulingRequest>,
) -> Result<Json<UnreserveResponse>, ApiError> {
    let released = state
        .engine
        .unreserve(&req.node, &req.workload)
        .map_err(|e| api_error(StatusCode::CONFLICT, e))?;
    Ok(Json(UnreserveResponse {
        workload: req.workload.id().to_string(),
        node: req.node,
        released,
    }))
}

async fn events(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ClusterEvent>, JsonRejection>,
) -> Result<Json<EventResponse>, ApiError> {
    let Json(event) = payload.map_err(|e| {
        warn!("Ignoring malformed event: {e}");
        api_error(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    let kind = event.kind().to_string();
    let applied = state.engine.process_event(event).await;
    Ok(Json(EventResponse { kind, applied }))
}

async fn report_status(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
    payload: Result<Json<StatusReport>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(report) = payload.map_err(|e| {
        warn!(node = %node, "Ignoring malformed status report: {e}");
        api_error(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    let applied = state
        .engine
        .report_status(&node, report.allocatable)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e),
            _ => api_error(StatusCode::SERVICE_UNAVAILABLE, e),
        })?;
    Ok(Json(StatusResponse { node, applied }))
}

async fn node_ledger(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> Result<Json<NodeLedger>, ApiError> {
    state
        .engine
        .node_snapshot(&node)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("node {node} is not registered")))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        registered_nodes: state.engine.handle().registered_nodes().len(),
        queued_reconciles: state.engine.context().queue().len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let body = state
        .engine
        .metrics()
        .render()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
