//! Daemon lifecycle: state, health probing, ordered shutdown, child processes and the
//! outer wrapper process.

pub mod health;
pub mod process;
pub mod shutdown;
pub mod wrapper;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared, observable daemon state. Transitions only move forward.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<DaemonState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DaemonState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> DaemonState {
        *self.tx.borrow()
    }

    /// Move to `next` unless the daemon is already past it. Returns whether it changed.
    pub fn advance(&self, next: DaemonState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(state = next.as_str(), "daemon state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.tx.subscribe()
    }

    /// Resolves once the state reaches `target` or later.
    pub async fn wait_for(&self, target: DaemonState) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail while we hold it.
        let _ = rx.wait_for(|s| *s >= target).await;
    }
}

/// Why the worker is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Signal,
    Shutdown,
    Restart,
}

/// One-shot stop request shared by signal handling and the admin endpoints.
#[derive(Clone, Default)]
pub struct ControlHandle {
    token: tokio_util::sync::CancellationToken,
    reason: Arc<parking_lot::Mutex<Option<StopReason>>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless a stop was already requested.
    pub fn request(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        tracing::info!(?reason, "stop requested");
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn requested(&self) -> StopReason {
        self.token.cancelled().await;
        self.reason.lock().unwrap_or(StopReason::Signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_stop_reason_wins() {
        let control = ControlHandle::new();
        control.request(StopReason::Restart);
        control.request(StopReason::Shutdown);
        assert!(control.is_requested());
        assert_eq!(control.requested().await, StopReason::Restart);
    }

    #[test]
    fn state_only_moves_forward() {
        let state = StateHandle::new();
        assert_eq!(state.get(), DaemonState::Starting);
        assert!(state.advance(DaemonState::Ready));
        assert!(state.advance(DaemonState::Draining));
        assert!(!state.advance(DaemonState::Ready));
        assert_eq!(state.get(), DaemonState::Draining);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_later_state() {
        let state = StateHandle::new();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for(DaemonState::Draining).await })
        };
        state.advance(DaemonState::Stopped);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
