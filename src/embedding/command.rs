//! External embedding process spoken to over JSON lines.
//!
//! Request: `{"texts": ["..."]}\n`. Response: `{"embeddings": [[...]]}\n` or
//! `{"error": "..."}\n`. The child is spawned lazily, tracked in the [`ProcessRegistry`],
//! and killed on timeout, protocol error or [`EmbeddingProvider::close`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::VectorConfig;
use crate::lifecycle::process::ProcessRegistry;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
}

struct Running {
    child: Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

pub struct CommandEmbeddingProvider {
    argv: Vec<String>,
    timeout: Duration,
    name: String,
    processes: Arc<ProcessRegistry>,
    running: Mutex<Option<Running>>,
}

impl CommandEmbeddingProvider {
    pub fn new(config: &VectorConfig, processes: Arc<ProcessRegistry>) -> Result<Self> {
        anyhow::ensure!(
            !config.command.is_empty(),
            "vector.embedding = \"command\" requires vector.command"
        );
        Ok(Self {
            argv: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            name: format!("command:{}", config.command[0]),
            processes,
            running: Mutex::new(None),
        })
    }

    fn spawn(&self) -> Result<Running> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(crate::lifecycle::wrapper::CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn embedding command {:?}", self.argv))?;
        let pid = child.id().context("embedding process exited immediately")?;
        let stdin = child.stdin.take().context("embedding process has no stdin")?;
        let stdout = child.stdout.take().context("embedding process has no stdout")?;

        self.processes.register(pid, &self.name);
        tracing::info!(pid, command = %self.argv[0], "embedding process started");

        Ok(Running {
            child,
            pid,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn round_trip(running: &mut Running, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut line = serde_json::to_vec(&EmbedRequest { texts })?;
        line.push(b'\n');
        running.stdin.write_all(&line).await?;
        running.stdin.flush().await?;

        let reply = running
            .stdout
            .next_line()
            .await?
            .context("embedding process closed its output")?;
        let response: EmbedResponse =
            serde_json::from_str(&reply).context("invalid embedding response")?;
        if let Some(err) = response.error {
            bail!("embedding process error: {err}");
        }
        if response.embeddings.len() != texts.len() {
            bail!(
                "embedding process returned {} vectors for {} texts",
                response.embeddings.len(),
                texts.len()
            );
        }
        response
            .embeddings
            .into_iter()
            .map(|v| {
                if v.len() != EMBEDDING_DIM {
                    bail!("expected {EMBEDDING_DIM} dimensions, got {}", v.len());
                }
                Ok(l2_normalize(&v))
            })
            .collect()
    }

    async fn kill(&self, running: &mut Running) {
        self.processes.unregister(running.pid);
        if let Err(e) = running.child.kill().await {
            tracing::debug!(pid = running.pid, error = %e, "embedding process already gone");
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CommandEmbeddingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let mut guard = self.running.lock().await;

        // Evicted by the registry, or exited on its own.
        let stale = match guard.as_mut() {
            Some(r) => !self.processes.pids().contains(&r.pid)
                || matches!(r.child.try_wait(), Ok(Some(_))),
            None => true,
        };
        if stale {
            if let Some(mut old) = guard.take() {
                self.kill(&mut old).await;
            }
            *guard = Some(self.spawn()?);
        }

        let Some(running) = guard.as_mut() else {
            bail!("embedding process unavailable");
        };
        match tokio::time::timeout(self.timeout, Self::round_trip(running, texts)).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => {
                if let Some(mut r) = guard.take() {
                    self.kill(&mut r).await;
                }
                Err(e)
            }
            Err(_) => {
                if let Some(mut r) = guard.take() {
                    self.kill(&mut r).await;
                }
                bail!("embedding process timed out after {:?}", self.timeout)
            }
        }
    }

    async fn close(&self) {
        if let Some(mut r) = self.running.lock().await.take() {
            tracing::info!(pid = r.pid, "stopping embedding process");
            self.kill(&mut r).await;
        }
    }
}
