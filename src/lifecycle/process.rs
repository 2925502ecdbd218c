//! Pid marker, child-process enumeration and the tracked set of spawned helpers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

/// Contents of `worker.pid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidInfo {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

pub fn write_pid_file(path: &Path, port: u16) -> Result<PidInfo> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let info = PidInfo {
        pid: std::process::id(),
        port,
        started_at: Utc::now(),
    };
    std::fs::write(path, serde_json::to_vec_pretty(&info)?)
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(info)
}

/// `None` when the file is missing or unreadable.
pub fn read_pid_file(path: &Path) -> Option<PidInfo> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Remove the marker only if it still names this process.
pub fn remove_pid_file(path: &Path) -> Result<bool> {
    match read_pid_file(path) {
        Some(info) if info.pid != std::process::id() => {
            tracing::warn!(pid = info.pid, "pid file belongs to another process, leaving it");
            Ok(false)
        }
        _ => match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        },
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from_u32(pid))
}

/// Direct children of `parent`.
pub fn child_pids(parent: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();
    let parent = Pid::from_u32(parent);
    sys.processes()
        .iter()
        .filter(|(_, p)| p.parent() == Some(parent))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Force-kill `pid`. Returns false when it was already gone.
pub fn kill_process(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid).map(|p| p.kill()).unwrap_or(false)
}

/// Poll until every pid in `pids` is gone or `timeout` elapses. Returns the survivors.
pub async fn wait_for_exit(pids: &[u32], timeout: Duration, poll: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|p| is_process_alive(*p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(poll).await;
    }
}

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    label: String,
    started: Instant,
}

/// Helper processes spawned by this worker (embedding backends).
///
/// Bounded by `max`: registering one more evicts and kills the oldest.
pub struct ProcessRegistry {
    max: usize,
    tracked: Mutex<Vec<TrackedProcess>>,
}

impl ProcessRegistry {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Track `pid`. Returns the pids evicted to stay within the limit.
    pub fn register(&self, pid: u32, label: &str) -> Vec<u32> {
        let evicted: Vec<TrackedProcess> = {
            let mut tracked = self.tracked.lock();
            tracked.push(TrackedProcess {
                pid,
                label: label.to_string(),
                started: Instant::now(),
            });
            tracked.sort_by_key(|t| t.started);
            let excess = tracked.len().saturating_sub(self.max);
            tracked.drain(..excess).collect()
        };
        for t in &evicted {
            tracing::warn!(pid = t.pid, label = %t.label, "process limit reached, evicting");
            kill_process(t.pid);
        }
        evicted.into_iter().map(|t| t.pid).collect()
    }

    pub fn unregister(&self, pid: u32) {
        self.tracked.lock().retain(|t| t.pid != pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.tracked.lock().iter().map(|t| t.pid).collect()
    }

    pub fn len(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill everything tracked. Returns the pids that were signalled.
    pub fn kill_all(&self) -> Vec<u32> {
        let all: Vec<TrackedProcess> = std::mem::take(&mut *self.tracked.lock());
        all.into_iter()
            .filter(|t| kill_process(t.pid))
            .map(|t| t.pid)
            .collect()
    }
}

/// Enumerates and force-kills the worker's own children during shutdown.
pub struct ProcessManager {
    registry: std::sync::Arc<ProcessRegistry>,
    pid_file: PathBuf,
}

impl ProcessManager {
    pub fn new(registry: std::sync::Arc<ProcessRegistry>, pid_file: PathBuf) -> Self {
        Self { registry, pid_file }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Tracked helpers plus any other direct children of this process.
    pub fn enumerate_children(&self) -> Vec<u32> {
        let mut pids = self.registry.pids();
        for pid in child_pids(std::process::id()) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
        pids
    }

    /// Kill `pids` still alive and wait, bounded, for them to exit.
    pub async fn force_kill(&self, pids: &[u32], timeout: Duration) -> Vec<u32> {
        self.registry.kill_all();
        for pid in pids {
            if kill_process(*pid) {
                tracing::info!(pid, "force-killed child process");
            }
        }
        let survivors = wait_for_exit(pids, timeout, Duration::from_millis(100)).await;
        if !survivors.is_empty() {
            tracing::warn!(?survivors, "child processes still alive after kill");
        }
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip_and_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");
        let info = write_pid_file(&path, 37777).unwrap();
        assert_eq!(read_pid_file(&path), Some(info));
        assert!(remove_pid_file(&path).unwrap());
        assert!(!path.exists());
        assert!(!remove_pid_file(&path).unwrap());
    }

    #[test]
    fn foreign_pid_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");
        let foreign = PidInfo {
            pid: std::process::id().wrapping_add(1),
            port: 1,
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_vec(&foreign).unwrap()).unwrap();
        assert!(!remove_pid_file(&path).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn registry_evicts_oldest_beyond_limit() {
        let registry = ProcessRegistry::new(2);
        // pids far above any real pid so eviction kills nothing
        assert!(registry.register(4_000_001, "a").is_empty());
        assert!(registry.register(4_000_002, "b").is_empty());
        let evicted = registry.register(4_000_003, "c");
        assert_eq!(evicted, vec![4_000_001]);
        assert_eq!(registry.pids(), vec![4_000_002, 4_000_003]);
        registry.unregister(4_000_002);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }
}
