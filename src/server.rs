//! Worker composition and the MCP stdio entry point.
//!
//! [`run_worker`] wires the store, providers, session manager, metrics and HTTP listener into a
//! running daemon and owns its lifecycle until a stop is requested. [`serve_mcp_stdio`] runs
//! the MCP tool server that proxies to a running worker.

use anyhow::{Context, Result};
use rmcp::ServiceExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::api::{create_router, AppState};
use crate::config::HindsightConfig;
use crate::db::manager::DatabaseManager;
use crate::lifecycle::health::HealthMonitor;
use crate::lifecycle::process::{write_pid_file, ProcessManager, ProcessRegistry};
use crate::lifecycle::shutdown::{shutdown_signal, GracefulShutdown, ListenerHandle, StepStatus};
use crate::lifecycle::wrapper::{notify_wrapper, WrapperMessage};
use crate::lifecycle::{ControlHandle, DaemonState, StateHandle, StopReason};
use crate::memory::queue;
use crate::memory::retention::apply_retention_now;
use crate::memory::store::now_epoch_ms;
use crate::metrics::MetricsService;
use crate::session::provider::{create_provider, GenerationProvider};
use crate::session::{RestartPolicy, SessionManager};
use crate::tools::HindsightTools;

/// Processed queue rows are kept this long for inspection.
const PROCESSED_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Everything a running worker is made of.
pub struct Worker {
    pub state: AppState,
    pub listener: ListenerHandle,
    pub processes: Arc<ProcessManager>,
    pub addr: SocketAddr,
}

fn build_providers(
    config: &HindsightConfig,
) -> Result<(Arc<dyn GenerationProvider>, Option<Arc<dyn GenerationProvider>>)> {
    let timeout = Duration::from_secs(config.provider.request_timeout_secs);
    let primary = create_provider(&config.provider.primary, timeout)
        .context("failed to create primary generation provider")?;
    let fallback = match &config.provider.fallback {
        Some(endpoint) => match create_provider(endpoint, timeout) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %e, "fallback provider unavailable, continuing without it");
                None
            }
        },
        None => None,
    };
    tracing::info!(
        primary = primary.name(),
        fallback = fallback.as_ref().map(|p| p.name()),
        "generation providers ready"
    );
    Ok((primary, fallback))
}

/// Open the store, build the session manager and start serving on the configured address.
pub async fn start_worker(config: HindsightConfig) -> Result<Worker> {
    let config = Arc::new(config);
    let registry = Arc::new(ProcessRegistry::new(config.vector.max_processes));
    let store = DatabaseManager::open(&config, Arc::clone(&registry))?;
    tracing::info!(
        db = %config.resolved_db_path().display(),
        vector = store.vector().backend_name(),
        "store ready"
    );

    let (primary, fallback) = build_providers(&config)?;
    let sessions = SessionManager::new(
        store.clone(),
        primary,
        fallback,
        config.sessions.clone(),
        RestartPolicy::from_config(&config.provider),
    );
    start_with(config, store, sessions, registry).await
}

/// Start serving with already-built parts.
pub async fn start_with(
    config: Arc<HindsightConfig>,
    store: DatabaseManager,
    sessions: SessionManager,
    registry: Arc<ProcessRegistry>,
) -> Result<Worker> {
    let metrics = Arc::new(MetricsService::new(sessions.clone(), store.clone())?);
    metrics.spawn_event_listener();

    let state = AppState::new(
        Arc::clone(&config),
        store,
        sessions,
        metrics,
        StateHandle::new(),
        ControlHandle::new(),
    );

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let tcp = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let addr = tcp.local_addr()?;

    let processes = Arc::new(ProcessManager::new(registry, config.pid_file_path()));
    write_pid_file(processes.pid_file(), addr.port())?;

    // Recovery finishes before the first request can enqueue new work.
    match state.sessions.recover_pending().await {
        Ok(n) if n > 0 => tracing::info!(recovered = n, "pending queue recovered"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "pending queue recovery failed"),
    }

    let listener = ListenerHandle::new();
    let app = create_router(state.clone());
    let graceful = listener.shutdown_signal();
    listener.attach(tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(graceful)
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
    }));
    tracing::info!(%addr, pid = std::process::id(), "worker listening");

    spawn_startup(&state);

    Ok(Worker {
        state,
        listener,
        processes,
        addr,
    })
}

/// Kick off the vector backfill, then report ready.
fn spawn_startup(state: &AppState) {
    let vector = Arc::clone(state.store.vector());
    if vector.is_enabled() {
        tokio::spawn(async move {
            match vector.ensure_backfilled().await {
                Ok(report) if report.documents_added > 0 => {
                    tracing::info!(
                        documents = report.documents_added,
                        "vector backfill finished"
                    )
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "vector backfill failed"),
            }
        });
    }
    state.daemon.advance(DaemonState::Ready);
}

/// Periodic stale-session reaping, retention and queue purging.
fn spawn_maintenance(state: &AppState) -> JoinHandle<()> {
    let state = state.clone();
    let every = Duration::from_secs(state.config.sessions.maintenance_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if state.daemon.get() >= DaemonState::Draining {
                break;
            }
            run_maintenance(&state).await;
        }
    })
}

async fn run_maintenance(state: &AppState) {
    state.sessions.reap_stale();

    let policy = state.config.retention.clone();
    let cutoff = now_epoch_ms() - PROCESSED_RETENTION_MS;
    let result = state
        .store
        .db()
        .call(move |conn| {
            let retained = if policy.enabled {
                Some(apply_retention_now(conn, &policy)?)
            } else {
                None
            };
            let purged = queue::purge_processed(conn, cutoff)?;
            Ok((retained, purged))
        })
        .await;
    match result {
        Ok((retained, purged)) => tracing::debug!(?retained, purged, "maintenance pass"),
        Err(e) => tracing::warn!(error = %e, "maintenance pass failed"),
    }
}

impl Worker {
    /// Wait for a stop request or signal, then tear down in order.
    pub async fn run_until_stopped(self) -> StopReason {
        let maintenance = spawn_maintenance(&self.state);
        let control = self.state.control.clone();

        let reason = tokio::select! {
            reason = control.requested() => reason,
            _ = shutdown_signal() => {
                control.request(StopReason::Signal);
                StopReason::Signal
            }
        };
        tracing::info!(?reason, "worker stopping");
        maintenance.abort();

        self.shutdown().await;
        reason
    }

    pub async fn shutdown(&self) {
        let graceful = GracefulShutdown::new(
            self.state.daemon.clone(),
            Arc::clone(&self.processes),
            self.listener.clone(),
            self.state.sessions.clone(),
            self.state.store.clone(),
            self.state.config.lifecycle.clone(),
        );
        for report in graceful.run().await {
            if report.status != StepStatus::Completed {
                tracing::warn!(
                    step = report.name,
                    status = ?report.status,
                    "shutdown step did not complete"
                );
            }
        }
    }
}

/// Entry point of `hindsight worker`.
pub async fn run_worker(config: HindsightConfig) -> Result<()> {
    let worker = start_worker(config).await?;
    let reason = worker.run_until_stopped().await;

    let message = match reason {
        StopReason::Restart => Some(WrapperMessage::Restart),
        StopReason::Shutdown => Some(WrapperMessage::Shutdown),
        StopReason::Signal => None,
    };
    if let Some(message) = message {
        if let Err(e) = notify_wrapper(message).await {
            tracing::warn!(error = %e, "failed to notify wrapper");
        }
    }
    Ok(())
}

/// Start the MCP server over stdio. Tools call the worker's HTTP API.
pub async fn serve_mcp_stdio(config: HindsightConfig) -> Result<()> {
    tracing::info!("starting hindsight MCP server on stdio");

    let monitor = HealthMonitor::for_config(&config);
    if !monitor.is_port_in_use().await {
        tracing::warn!(
            url = %monitor.base_url(),
            "worker is not running; tools will fail until it starts"
        );
    }

    let tools = HindsightTools::new(monitor.base_url().to_string());
    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");
    Ok(())
}
