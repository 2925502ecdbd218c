//! Health, readiness, version, admin and metrics handlers.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::error::{ApiResult, WorkerError};
use crate::lifecycle::{DaemonState, StopReason};
use crate::memory::retention::{apply_retention_now, RetentionReport};
use crate::metrics::MetricsSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub state: DaemonState,
    pub version: &'static str,
    pub pid: u32,
    pub uptime_secs: u64,
    pub is_processing: bool,
    pub queue_depth: usize,
    pub active_sessions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let daemon = state.daemon.get();
    Json(HealthResponse {
        status: if daemon >= DaemonState::Draining { "draining" } else { "ok" },
        state: daemon,
        version: crate::VERSION,
        pid: std::process::id(),
        uptime_secs: state.uptime_secs(),
        is_processing: state.sessions.is_any_session_processing(),
        queue_depth: state.sessions.queue_depth(),
        active_sessions: state.sessions.active_sessions(),
    })
}

fn state_response(ok: bool, daemon: DaemonState) -> Response {
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ok, "state": daemon }))).into_response()
}

/// 200 once recovery and backfill have been started and the listener is serving.
pub async fn readiness(State(state): State<AppState>) -> Response {
    let daemon = state.daemon.get();
    state_response(daemon == DaemonState::Ready, daemon)
}

/// 200 while the store and session manager are up, which is true for as long as this router
/// is serving and the worker is not draining.
pub async fn core_ready(State(state): State<AppState>) -> Response {
    let daemon = state.daemon.get();
    state_response(daemon < DaemonState::Draining, daemon)
}

pub async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": crate::VERSION }))
}

pub async fn shutdown(State(state): State<AppState>) -> Json<serde_json::Value> {
    tracing::info!("shutdown requested over HTTP");
    state.control.request(StopReason::Shutdown);
    Json(json!({ "ok": true, "action": "shutdown" }))
}

pub async fn restart(State(state): State<AppState>) -> Json<serde_json::Value> {
    tracing::info!("restart requested over HTTP");
    state.control.request(StopReason::Restart);
    Json(json!({ "ok": true, "action": "restart" }))
}

pub async fn retention(State(state): State<AppState>) -> ApiResult<Json<RetentionReport>> {
    let policy = state.config.retention.clone();
    if !policy.enabled {
        return Err(WorkerError::validation("retention is disabled in configuration"));
    }
    let report = state
        .store
        .db()
        .call(move |conn| apply_retention_now(conn, &policy))
        .await?;
    tracing::info!(
        observations = report.observations,
        summaries = report.summaries,
        "retention applied"
    );
    Ok(Json(report))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let body = state.metrics.render_prometheus().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}

pub async fn json_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot().await)
}
