//! Probing a (possibly) running worker over its HTTP surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::HindsightConfig;

/// Per-request timeout for a single probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionCheck {
    pub matches: bool,
    pub expected: String,
    /// `None` when the worker could not be reached.
    pub running: Option<String>,
}

#[derive(Deserialize)]
struct VersionBody {
    version: String,
}

pub struct HealthMonitor {
    base_url: String,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval,
            http,
        }
    }

    /// Probe the configured worker. A wildcard bind address is probed on loopback.
    pub fn for_config(config: &HindsightConfig) -> Self {
        let host = match config.server.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        Self::new(
            format!("http://{host}:{}", config.server.port),
            Duration::from_millis(config.lifecycle.poll_interval_ms),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Any HTTP response, whatever its status, means something owns the port.
    pub async fn is_port_in_use(&self) -> bool {
        self.http.get(self.url("/api/health")).send().await.is_ok()
    }

    /// Poll the readiness endpoint until it answers 2xx or `timeout` elapses.
    pub async fn wait_for_health(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = self.http.get(self.url("/api/readiness")).send().await {
                if resp.status().is_success() {
                    return true;
                }
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not become healthy"
                );
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until a connection attempt fails or `timeout` elapses.
    pub async fn wait_for_port_free(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.http.get(self.url("/api/health")).send().await.is_err() {
                return true;
            }
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "port still in use");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn running_version(&self) -> Option<String> {
        let resp = self.http.get(self.url("/api/version")).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<VersionBody>().await.ok().map(|b| b.version)
    }

    /// Compare `expected` against the running worker. An unreachable worker counts as a match.
    pub async fn check_version(&self, expected: &str) -> VersionCheck {
        let running = self.running_version().await;
        VersionCheck {
            matches: running.as_deref().map_or(true, |v| v == expected),
            expected: expected.to_string(),
            running,
        }
    }

    /// Ask the worker to shut down. `false` when it could not be reached.
    pub async fn request_shutdown(&self) -> bool {
        match self.http.post(self.url("/api/admin/shutdown")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "shutdown request failed");
                false
            }
        }
    }

    pub async fn fetch_json(&self, path: &str) -> Option<serde_json::Value> {
        let resp = self.http.get(self.url(path)).send().await.ok()?;
        resp.json().await.ok()
    }
}
