//! Outer supervisor process.
//!
//! The wrapper spawns the inner worker with inherited stdio plus a loopback TCP channel
//! whose address travels in [`IPC_ENV`]. The worker sends newline-delimited JSON
//! ([`WrapperMessage`]); on `restart` or `shutdown` the wrapper waits briefly for the worker
//! to exit, kills it if needed and exits 0. If the worker dies on its own, the wrapper exits
//! with the same code and leaves relaunching to whoever started it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub const IPC_ENV: &str = "HINDSIGHT_WRAPPER_IPC";

/// `CREATE_NO_WINDOW` process creation flag.
#[cfg(windows)]
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Time the worker gets to exit on its own after asking for a restart or shutdown.
const EXIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WrapperMessage {
    Restart,
    Shutdown,
}

/// Send `message` to the wrapper, if this process runs under one. Returns whether it was sent.
pub async fn notify_wrapper(message: WrapperMessage) -> Result<bool> {
    let Ok(addr) = std::env::var(IPC_ENV) else {
        return Ok(false);
    };
    send_message(&addr, message).await?;
    tracing::info!(?message, "wrapper notified");
    Ok(true)
}

pub async fn send_message(addr: &str, message: WrapperMessage) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to wrapper at {addr}"))?;
    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}

/// Build the command that runs the inner worker from the current executable.
pub fn worker_command(args: &[String]) -> Result<Command> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    let mut cmd = Command::new(exe);
    cmd.args(args);
    Ok(cmd)
}

pub struct Supervisor {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Supervisor {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind wrapper IPC listener")?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawn `cmd` and supervise it. Returns the exit code the wrapper should exit with.
    pub async fn run(self, mut cmd: Command) -> Result<i32> {
        cmd.env(IPC_ENV, self.addr.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().context("failed to spawn worker")?;
        tracing::info!(pid = child.id(), ipc = %self.addr, "worker spawned");

        let (tx, mut rx) = mpsc::channel::<WrapperMessage>(8);
        let listener = self.listener;
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { continue };
                let tx = tx.clone();
                tokio::spawn(read_messages(stream, tx));
            }
        });

        let code = tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for worker")?;
                let code = status.code().unwrap_or(1);
                tracing::warn!(code, "worker exited unexpectedly");
                code
            }
            Some(message) = rx.recv() => {
                tracing::info!(?message, "worker requested stop");
                stop_child(&mut child).await;
                0
            }
        };
        acceptor.abort();
        Ok(code)
    }
}

async fn read_messages(stream: TcpStream, tx: mpsc::Sender<WrapperMessage>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<WrapperMessage>(&line) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "ignoring malformed wrapper message")
            }
        }
    }
}

async fn stop_child(child: &mut Child) {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(code = ?status.code(), "worker exited"),
        _ => {
            tracing::warn!("worker did not exit in time, killing it");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "failed to kill worker");
            }
        }
    }
}

/// Entry point of `hindsight wrapper`.
pub async fn run_wrapper(worker_args: &[String]) -> Result<i32> {
    let supervisor = Supervisor::bind().await?;
    supervisor.run(worker_command(worker_args)?).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_format() {
        assert_eq!(
            serde_json::to_string(&WrapperMessage::Restart).unwrap(),
            r#"{"type":"restart"}"#
        );
        let parsed: WrapperMessage = serde_json::from_str(r#"{"type":"shutdown"}"#).unwrap();
        assert_eq!(parsed, WrapperMessage::Shutdown);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexpected_exit_code_is_propagated() {
        let supervisor = Supervisor::bind().await.unwrap();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        assert_eq!(supervisor.run(cmd).await.unwrap(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_message_stops_worker() {
        let supervisor = Supervisor::bind().await.unwrap();
        let addr = supervisor.addr().to_string();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 30"]);
        let run = tokio::spawn(supervisor.run(cmd));

        tokio::time::sleep(Duration::from_millis(100)).await;
        send_message(&addr, WrapperMessage::Shutdown).await.unwrap();

        // The child ignores the request, so the wrapper waits out the grace period and kills it.
        let code = tokio::time::timeout(EXIT_GRACE + Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }
}
