//! JSON-RPC over stdio transport.
//!
//! Owns exactly one MCP server child process at a time:
//! - Writing newline-delimited JSON messages to stdin
//! - A reader task that turns stdout lines into [`TransportEvent`]s and ends
//!   with `Exited` when the stream closes
//! - A stderr drain that keeps the last lines for launch diagnostics
//! - Graceful stop (close stdin, wait, then kill)
//!
//! [`Transport`] and [`Launcher`] are the seams the session layer talks to,
//! so tests can substitute a scripted in-memory server for the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Capacity of the stdout event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Number of stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long the reader waits to collect an exit status after stdout closes.
const EXIT_REAP_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Something read from the server's stdout, or the end of the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One non-empty line of output.
    Message(String),
    /// Stdout closed; carries the exit code if the process could be reaped.
    Exited(Option<i32>),
}

/// Byte-level connection to one server instance.
pub trait Transport: Send + Sync {
    /// Write one framed message. `message` must not contain a newline.
    fn send(&self, message: String) -> BoxFuture<'_, Result<(), McpError>>;

    /// Terminate the server. Safe to call more than once.
    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Whether the underlying process is still running.
    fn is_alive(&self) -> bool;

    /// OS process id, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Signal the server to die without waiting for it. Used where `stop`
    /// cannot be awaited, such as when a handshake is cancelled.
    fn start_kill(&self) {}

    /// Time since the server last produced output, when tracked.
    fn idle_for(&self) -> Option<Duration> {
        None
    }
}

/// A freshly started transport plus its receive stream.
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Starts a new transport. Called once per (re)connection.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> BoxFuture<'_, Result<TransportHandle, McpError>>;

    /// Human-readable description of what gets launched (for logs).
    fn describe(&self) -> String;
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Ring buffer of the most recent stderr lines.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

async fn drain_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
        tail.push(line);
    }
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    stopped: AtomicBool,
    pid: Option<u32>,
    started_at: Instant,
    last_seen: Arc<std::sync::Mutex<Instant>>,
    shutdown_grace: Duration,
}

impl StdioTransport {
    /// Spawn the server process and start its reader tasks.
    ///
    /// Fails with `LaunchFailed` if the executable cannot be spawned or the
    /// process exits within `startup_grace`.
    pub async fn start(
        server_name: &str,
        config: &ServerConfig,
        startup_grace: Duration,
        shutdown_grace: Duration,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "server command is empty".into(),
            });
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::LaunchFailed {
            command: config.command.clone(),
            reason: if e.kind() == std::io::ErrorKind::NotFound {
                format!("executable not found: {e}")
            } else {
                e.to_string()
            },
        })?;

        let launch_err = |reason: &str| McpError::LaunchFailed {
            command: config.command.clone(),
            reason: reason.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| launch_err("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_err("failed to capture stdout"))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        let started_at = Instant::now();
        let child = Arc::new(Mutex::new(child));
        let alive = Arc::new(AtomicBool::new(true));
        let last_seen = Arc::new(std::sync::Mutex::new(started_at));
        let tail = StderrTail::default();

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(server_name.to_string(), stderr, tail.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(read_stdout(
            server_name.to_string(),
            stdout,
            Arc::downgrade(&child),
            Arc::clone(&alive),
            Arc::clone(&last_seen),
            tx,
        ));

        tracing::info!(
            server = server_name,
            command = %config.command,
            args = ?config.args,
            pid = ?pid,
            "spawned MCP server process"
        );

        // A process that dies right away (bad args, missing credentials)
        // is a launch failure, not a protocol failure.
        if !startup_grace.is_zero() {
            tokio::time::sleep(startup_grace).await;
            let exited = child.lock().await.try_wait().ok().flatten();
            if let Some(status) = exited {
                alive.store(false, Ordering::SeqCst);
                // Give the stderr drain a moment to catch the final lines.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let stderr_ctx = tail.snapshot();
                if !stderr_ctx.is_empty() {
                    tracing::warn!(
                        server = server_name,
                        stderr = %stderr_ctx,
                        "server stderr captured on launch failure"
                    );
                }
                return Err(McpError::LaunchFailed {
                    command: config.command.clone(),
                    reason: format!(
                        "process exited during startup ({status}){}",
                        format_stderr_suffix(&stderr_ctx)
                    ),
                });
            }
        }

        let transport = Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(stdin)),
            child,
            alive,
            stopped: AtomicBool::new(false),
            pid,
            started_at,
            last_seen,
            shutdown_grace,
        };

        Ok((transport, rx))
    }

    /// Time since the process was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since the server last wrote a line to stdout.
    pub fn last_output_age(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn kill_without_wait(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // A held lock means `shutdown` or the reader is already collecting
        // the exit; both end with the process gone.
        let Ok(mut child) = self.child.try_lock() else {
            return;
        };
        match child.start_kill() {
            Ok(()) => tracing::debug!(server = %self.server_name, pid = ?self.pid, "kill signal sent"),
            Err(e) => tracing::trace!(server = %self.server_name, error = %e, "kill skipped"),
        }
    }

    async fn write_line(&self, mut message: String) -> Result<(), McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(McpError::ProcessExited { code: None });
        }
        message.push('\n');

        let mut writer = self.writer.lock().await;
        let stdin = writer.as_mut().ok_or_else(|| McpError::BrokenPipe {
            reason: "stdin already closed".into(),
        })?;

        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| McpError::BrokenPipe {
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| McpError::BrokenPipe {
            reason: format!("failed to flush stdin: {e}"),
        })?;

        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // Closing stdin is the graceful shutdown signal for stdio servers.
        drop(self.writer.lock().await.take());

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    server = %self.server_name,
                    status = %status,
                    uptime_secs = self.uptime().as_secs(),
                    "MCP server exited"
                );
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "server did not exit within grace period, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.server_name, error = %e, "kill failed");
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Transport for StdioTransport {
    fn send(&self, message: String) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(self.write_line(message))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn start_kill(&self) {
        self.kill_without_wait();
    }

    fn idle_for(&self) -> Option<Duration> {
        Some(self.last_output_age())
    }
}

/// Forward stdout lines until the stream closes, then report the exit.
async fn read_stdout(
    server: String,
    stdout: ChildStdout,
    child: Weak<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    last_seen: Arc<std::sync::Mutex<Instant>>,
    tx: mpsc::Sender<TransportEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                if tx
                    .send(TransportEvent::Message(trimmed.to_string()))
                    .await
                    .is_err()
                {
                    // Receiver gone: the session was torn down.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from stdout");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);

    // The transport owns the child; once it is gone the process was
    // killed on drop and there is no status left to collect here.
    let code = match child.upgrade() {
        Some(child) => {
            let mut child = child.lock().await;
            match tokio::time::timeout(EXIT_REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => None,
            }
        }
        None => None,
    };
    tracing::info!(server = %server, code = ?code, "server stdout closed");
    let _ = tx.send(TransportEvent::Exited(code)).await;
}

// ─── ProcessLauncher ─────────────────────────────────────────────────────────

/// Launches the configured server as a child process.
pub struct ProcessLauncher {
    server_name: String,
    config: ServerConfig,
    startup_grace: Duration,
    shutdown_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(
        server_name: &str,
        config: ServerConfig,
        startup_grace: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            config,
            startup_grace,
            shutdown_grace,
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<TransportHandle, McpError>> {
        Box::pin(async move {
            let (transport, events) = StdioTransport::start(
                &self.server_name,
                &self.config,
                self.startup_grace,
                self.shutdown_grace,
            )
            .await?;
            Ok(TransportHandle {
                transport: Arc::new(transport),
                events,
            })
        })
    }

    fn describe(&self) -> String {
        let mut parts = vec![self.config.command.clone()];
        parts.extend(self.config.args.iter().cloned());
        parts.join(" ")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
