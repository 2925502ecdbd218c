//! Ordered graceful shutdown. Each step runs under its own timeout; a step that fails or
//! hangs is logged and skipped so the remaining steps still run.

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::{remove_pid_file, ProcessManager};
use super::{DaemonState, StateHandle};
use crate::config::LifecycleConfig;
use crate::db::manager::DatabaseManager;
use crate::session::SessionManager;

/// Pause around listener close so sockets are released before the port is reused.
#[cfg(windows)]
const SOCKET_SETTLE: Duration = Duration::from_millis(500);
#[cfg(not(windows))]
const SOCKET_SETTLE: Duration = Duration::from_millis(50);

pub struct ShutdownStep {
    name: &'static str,
    timeout: Duration,
    run: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl ShutdownStep {
    pub fn new<F, Fut>(name: &'static str, timeout: Duration, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            timeout,
            run: Box::new(move || Box::pin(f())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: &'static str,
    pub status: StepStatus,
    pub elapsed_ms: u64,
}

/// Run `steps` in order, each bounded by its own timeout.
pub async fn run_steps(steps: Vec<ShutdownStep>) -> Vec<StepReport> {
    let mut reports = Vec::with_capacity(steps.len());
    for step in steps {
        let started = Instant::now();
        let status = match tokio::time::timeout(step.timeout, (step.run)()).await {
            Ok(Ok(())) => {
                tracing::info!(step = step.name, "shutdown step completed");
                StepStatus::Completed
            }
            Ok(Err(e)) => {
                tracing::warn!(step = step.name, error = %e, "shutdown step failed, continuing");
                StepStatus::Failed(format!("{e:#}"))
            }
            Err(_) => {
                tracing::warn!(
                    step = step.name,
                    timeout_ms = step.timeout.as_millis() as u64,
                    "shutdown step timed out, skipping"
                );
                StepStatus::TimedOut
            }
        };
        reports.push(StepReport {
            name: step.name,
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
    reports
}

/// The HTTP listener's stop switch and serving task.
#[derive(Clone, Default)]
pub struct ListenerHandle {
    token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ListenerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Future for `axum::serve(..).with_graceful_shutdown(..)`.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        self.token.clone().cancelled_owned()
    }

    pub fn attach(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub fn is_closing(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting, then wait for the serving task to return.
    pub async fn close(&self) -> Result<()> {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await?;
        }
        Ok(())
    }
}

/// Owns the worker's teardown sequence.
pub struct GracefulShutdown {
    state: StateHandle,
    processes: Arc<ProcessManager>,
    listener: ListenerHandle,
    sessions: SessionManager,
    store: DatabaseManager,
    config: LifecycleConfig,
    started: AtomicBool,
}

impl GracefulShutdown {
    pub fn new(
        state: StateHandle,
        processes: Arc<ProcessManager>,
        listener: ListenerHandle,
        sessions: SessionManager,
        store: DatabaseManager,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            state,
            processes,
            listener,
            sessions,
            store,
            config,
            started: AtomicBool::new(false),
        }
    }

    /// Run the sequence once. Later calls return an empty report.
    pub async fn run(&self) -> Vec<StepReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.state.advance(DaemonState::Draining);
        tracing::info!("graceful shutdown started");

        let reports = run_steps(self.steps()).await;

        self.state.advance(DaemonState::Stopped);
        let skipped = reports.iter().filter(|r| r.status != StepStatus::Completed).count();
        tracing::info!(steps = reports.len(), skipped, "graceful shutdown finished");
        reports
    }

    fn steps(&self) -> Vec<ShutdownStep> {
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let children: Arc<Mutex<Vec<u32>>> = Arc::default();

        let pid_file = self.processes.pid_file().to_path_buf();
        let processes = Arc::clone(&self.processes);
        let found = Arc::clone(&children);
        let listener = self.listener.clone();
        let sessions = self.sessions.clone();
        let session_timeout = Duration::from_millis(self.config.session_stop_timeout_ms);
        let vector = Arc::clone(self.store.vector());
        let store = self.store.clone();
        let killer = Arc::clone(&self.processes);
        let exit_timeout = Duration::from_millis(self.config.child_exit_timeout_ms);

        vec![
            ShutdownStep::new("remove_pid_file", step_timeout, move || async move {
                remove_pid_file(&pid_file).map(|_| ())
            }),
            ShutdownStep::new("enumerate_children", step_timeout, move || async move {
                let pids = processes.enumerate_children();
                tracing::debug!(?pids, "child processes at shutdown");
                *found.lock() = pids;
                Ok(())
            }),
            ShutdownStep::new("close_listener", step_timeout, move || async move {
                tokio::time::sleep(SOCKET_SETTLE).await;
                listener.close().await?;
                tokio::time::sleep(SOCKET_SETTLE).await;
                Ok(())
            }),
            ShutdownStep::new("stop_sessions", session_timeout + step_timeout, move || async move {
                if sessions.shutdown_all(session_timeout).await {
                    Ok(())
                } else {
                    anyhow::bail!("sessions did not stop within {}ms", session_timeout.as_millis())
                }
            }),
            ShutdownStep::new("close_vector_client", step_timeout, move || async move {
                vector.close().await;
                Ok(())
            }),
            ShutdownStep::new("close_store", step_timeout, move || async move {
                store.db().close().await
            }),
            ShutdownStep::new("kill_children", exit_timeout + step_timeout, move || async move {
                let pids = children.lock().clone();
                let survivors = killer.force_kill(&pids, exit_timeout).await;
                if survivors.is_empty() {
                    Ok(())
                } else {
                    anyhow::bail!("{} child processes survived", survivors.len())
                }
            }),
        ]
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hung_step_is_skipped_and_later_steps_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let steps = vec![
            ShutdownStep::new("ok", Duration::from_millis(100), || async { Ok(()) }),
            ShutdownStep::new("hangs", Duration::from_millis(50), || async {
                std::future::pending::<()>().await;
                Ok(())
            }),
            ShutdownStep::new("fails", Duration::from_millis(100), || async {
                anyhow::bail!("boom")
            }),
            ShutdownStep::new("after", Duration::from_millis(100), move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let started = Instant::now();
        let reports = run_steps(steps).await;
        assert!(started.elapsed() < Duration::from_millis(350));

        let statuses: Vec<_> = reports.iter().map(|r| r.status.clone()).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Completed,
                StepStatus::TimedOut,
                StepStatus::Failed("boom".into()),
                StepStatus::Completed,
            ]
        );
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn listener_handle_closes_serving_task() {
        let handle = ListenerHandle::new();
        let signal = handle.shutdown_signal();
        handle.attach(tokio::spawn(signal));
        assert!(!handle.is_closing());
        tokio::time::timeout(Duration::from_secs(1), handle.close())
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_closing());
    }
}
