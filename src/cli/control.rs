//! CLI `start`, `stop`, `restart` and `status`: managing the background worker.
//!
//! `start` probes the port first. A healthy worker of the same version is left alone; one of a
//! different version is shut down, and once the port is free a detached wrapper is spawned and
//! polled until the worker reports ready.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::config::HindsightConfig;
use crate::lifecycle::health::HealthMonitor;
use crate::lifecycle::process::{is_process_alive, kill_process, read_pid_file, remove_pid_file};

/// How long `stop` waits for the port after asking the worker to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Started,
}

fn worker_log_path(config: &HindsightConfig) -> PathBuf {
    config.data_dir().join("logs").join("worker.log")
}

/// Spawn `hindsight wrapper` in the background, detached from this terminal.
fn spawn_detached(config: &HindsightConfig, config_path: Option<&Path>) -> Result<u32> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    let log_path = worker_log_path(config);
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let mut cmd = std::process::Command::new(exe);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("wrapper")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(crate::lifecycle::wrapper::CREATE_NO_WINDOW | DETACHED_PROCESS);
    }

    let child = cmd.spawn().context("failed to spawn wrapper")?;
    Ok(child.id())
}

pub async fn start(config: &HindsightConfig, config_path: Option<&Path>) -> Result<StartOutcome> {
    let monitor = HealthMonitor::for_config(config);
    let health_timeout = Duration::from_millis(config.lifecycle.health_timeout_ms);

    if monitor.is_port_in_use().await {
        let check = monitor.check_version(crate::VERSION).await;
        if check.matches {
            if monitor.wait_for_health(health_timeout).await {
                println!("Worker already running at {}", monitor.base_url());
                return Ok(StartOutcome::AlreadyRunning);
            }
            bail!("port {} is in use but the worker there never became ready", config.server.port);
        }

        println!(
            "Worker version {} differs from {}, replacing it",
            check.running.as_deref().unwrap_or("unknown"),
            check.expected
        );
        monitor.request_shutdown().await;
        if !monitor.wait_for_port_free(STOP_TIMEOUT).await {
            bail!("old worker did not release port {}", config.server.port);
        }
    }

    let pid = spawn_detached(config, config_path)?;
    tracing::info!(pid, "wrapper spawned");

    if !monitor.wait_for_health(health_timeout).await {
        bail!(
            "worker did not become ready within {}ms; see {}",
            health_timeout.as_millis(),
            worker_log_path(config).display()
        );
    }
    println!("Worker started at {} (wrapper pid {pid})", monitor.base_url());
    Ok(StartOutcome::Started)
}

/// Returns whether a worker was stopped.
pub async fn stop(config: &HindsightConfig) -> Result<bool> {
    let monitor = HealthMonitor::for_config(config);
    let pid_path = config.pid_file_path();

    if monitor.request_shutdown().await {
        if monitor.wait_for_port_free(STOP_TIMEOUT).await {
            println!("Worker stopped");
            return Ok(true);
        }
        println!("Worker did not exit in time");
    }

    // Unreachable or stuck: fall back to the pid marker.
    match read_pid_file(&pid_path) {
        Some(info) if is_process_alive(info.pid) => {
            if kill_process(info.pid) {
                println!("Worker (pid {}) killed", info.pid);
            }
            std::fs::remove_file(&pid_path).ok();
            Ok(true)
        }
        Some(_) => {
            remove_pid_file(&pid_path).ok();
            println!("Worker not running (removed stale pid file)");
            Ok(false)
        }
        None => {
            println!("Worker not running");
            Ok(false)
        }
    }
}

pub async fn restart(config: &HindsightConfig, config_path: Option<&Path>) -> Result<()> {
    stop(config).await?;
    start(config, config_path).await?;
    Ok(())
}

pub async fn status(config: &HindsightConfig) -> Result<()> {
    let monitor = HealthMonitor::for_config(config);
    let pid = read_pid_file(&config.pid_file_path());

    match monitor.fetch_json("/api/health").await {
        Some(health) => {
            println!("Worker:        running at {}", monitor.base_url());
            let field = |name: &str| health.get(name).map(|v| v.to_string()).unwrap_or_default();
            println!("State:         {}", field("state").trim_matches('"'));
            println!("Version:       {}", field("version").trim_matches('"'));
            println!("Pid:           {}", field("pid"));
            println!("Uptime (s):    {}", field("uptime_secs"));
            println!("Processing:    {}", field("is_processing"));
            println!("Queue depth:   {}", field("queue_depth"));
            println!("Sessions:      {}", field("active_sessions"));
        }
        None => {
            println!("Worker:        not running");
            if let Some(info) = pid {
                let alive = if is_process_alive(info.pid) { "alive" } else { "dead" };
                println!("Pid file:      pid {} ({alive}), port {}", info.pid, info.port);
            }
        }
    }
    Ok(())
}
