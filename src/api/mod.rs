//! HTTP surface of the worker.
//!
//! # Endpoints
//!
//! ## System
//! - `GET /health`, `GET /api/health` - liveness, queue depth, processing flag
//! - `GET /api/readiness`, `GET /api/core-ready` - staged readiness
//! - `GET /api/version`
//! - `POST /api/admin/shutdown`, `POST /api/restart`, `POST /api/admin/retention`
//! - `GET /metrics` (text exposition), `GET /api/metrics` (JSON)
//!
//! ## Sessions
//! - `POST /api/sessions/init`, `/observations`, `/summarize`, `/complete`
//!
//! ## Reads
//! - `GET /api/search`, `/api/search/by-concept`, `/api/search/by-type`, `/api/search/by-file`
//! - `POST /api/observations/batch`
//! - `GET /api/context/inject`
//! - `GET /stream` - server-sent worker events
//!
//! ## Auth
//! - `GET /login`, `POST /api/auth/login`
//!
//! Requests pass through request metrics, then rate limiting, then auth.

pub mod auth;
pub mod rate_limit;
pub mod search;
pub mod sessions;
pub mod stream;
pub mod system;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::HindsightConfig;
use crate::db::manager::DatabaseManager;
use crate::lifecycle::{ControlHandle, StateHandle};
use crate::metrics::MetricsService;
use crate::session::SessionManager;

pub use auth::AuthConfig;
pub use rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HindsightConfig>,
    pub store: DatabaseManager,
    pub sessions: SessionManager,
    pub metrics: Arc<MetricsService>,
    pub daemon: StateHandle,
    pub control: ControlHandle,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthConfig>,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<HindsightConfig>,
        store: DatabaseManager,
        sessions: SessionManager,
        metrics: Arc<MetricsService>,
        daemon: StateHandle,
        control: ControlHandle,
    ) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::from_settings(&config.server.rate_limit)),
            auth: Arc::new(AuthConfig::new(config.server.auth_token.as_deref())),
            config,
            store,
            sessions,
            metrics,
            daemon,
            control,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Peer address recorded by `into_make_service_with_connect_info`. Absent means unknown,
/// which is treated as non-loopback.
pub fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

async fn record_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    let status = response.status();
    state.metrics.record_request(start.elapsed(), status.as_u16() >= 400);
    tracing::debug!(
        %method,
        %path,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // System
        .route("/health", get(system::health))
        .route("/api/health", get(system::health))
        .route("/api/readiness", get(system::readiness))
        .route("/api/core-ready", get(system::core_ready))
        .route("/api/version", get(system::version))
        .route("/api/admin/shutdown", post(system::shutdown))
        .route("/api/restart", post(system::restart))
        .route("/api/admin/retention", post(system::retention))
        .route("/metrics", get(system::prometheus_metrics))
        .route("/api/metrics", get(system::json_metrics))
        // Sessions
        .route("/api/sessions/init", post(sessions::init))
        .route("/api/sessions/observations", post(sessions::observations))
        .route("/api/sessions/summarize", post(sessions::summarize))
        .route("/api/sessions/complete", post(sessions::complete))
        .route("/api/sessions", get(sessions::list))
        // Reads
        .route("/api/search", get(search::search))
        .route("/api/search/by-concept", get(search::by_concept))
        .route("/api/search/by-type", get(search::by_type))
        .route("/api/search/by-file", get(search::by_file))
        .route("/api/observations/batch", post(search::observations_batch))
        .route("/api/context/inject", get(search::context_inject))
        .route("/stream", get(stream::events))
        // Auth
        .route("/login", get(auth::login_page))
        .route("/api/auth/login", post(auth::login))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), record_metrics))
        .with_state(state)
}
