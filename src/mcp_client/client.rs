//! The async connection manager.
//!
//! Owns the single server connection: its [`ConnectionState`], the current
//! [`Session`], the reconnect lock and the health monitor. Operation calls
//! read the state without the lock; only connect, reconnect and disconnect
//! swap the session, and they do so one at a time.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::health;
use super::resolver::{args, Resolver};
use super::session::{HandshakeTimeouts, Session};
use super::transport::Launcher;
use super::types::{ConnectionState, OperationIntent, ServerInfo};
use crate::config::{ClientConfig, HealthConfig, TimeoutConfig};

// ─── Status ──────────────────────────────────────────────────────────────────

/// Point-in-time view of the connection, for display.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub server_name: String,
    pub state: ConnectionState,
    /// Discovered tool names, sorted.
    pub tools: Vec<String>,
    pub server_info: Option<ServerInfo>,
    pub pid: Option<u32>,
    /// Age of the current session.
    pub uptime_secs: Option<u64>,
    /// Time since the server last wrote output.
    pub idle_secs: Option<u64>,
    pub indexed_repositories: Vec<String>,
    /// Last time the server was known to be responsive.
    pub last_healthy: Option<DateTime<Utc>>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Connection manager for one research server.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) server_name: String,
    launcher: Arc<dyn Launcher>,
    resolver: Resolver,
    pub(super) timeouts: TimeoutConfig,
    pub(super) health: HealthConfig,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes connect, reconnect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    /// Bumped every time a new session is installed.
    generation: AtomicU64,
    /// Woken when a transport is observed to be gone.
    pub(super) lost: Arc<Notify>,
    /// Set when the configuration cannot be run; `connect` refuses it.
    config_error: Option<String>,
    indexed: Mutex<BTreeSet<String>>,
    last_healthy: Mutex<Option<(Instant, DateTime<Utc>)>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Client for the server described by `config`.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_launcher(config, config.build_launcher())
    }

    /// Client using a custom launcher (e.g. an in-memory server in tests).
    ///
    /// An unusable configuration is reported by `connect`.
    pub fn with_launcher(config: &ClientConfig, launcher: Arc<dyn Launcher>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let config_error = match config.check() {
            Ok(()) => None,
            Err(McpError::ConfigError { reason }) => Some(reason),
            Err(other) => Some(other.to_string()),
        };
        Self {
            inner: Arc::new(Inner {
                server_name: config.server_name.clone(),
                launcher,
                resolver: config.resolver.build_resolver(),
                timeouts: config.timeouts.clone(),
                health: config.health.clone(),
                state,
                session: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                lost: Arc::new(Notify::new()),
                config_error,
                indexed: Mutex::new(BTreeSet::new()),
                last_healthy: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start the server and bring the connection to Ready.
    ///
    /// A no-op when already Ready.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.inner.connect().await
    }

    /// Tear down the current session (if any) and establish a new one.
    pub async fn reconnect(&self) -> Result<(), McpError> {
        let observed = self.inner.generation();
        self.inner.reconnect(observed, "reconnect requested").await
    }

    /// Stop the server. Supersedes any reconnect in progress.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Kill the server without awaiting anything, for teardown paths that
    /// cannot await.
    pub fn abandon(&self) {
        self.inner.abandon();
    }

    // ─── State ───────────────────────────────────────────────────────────

    /// Current state. A Ready connection whose process has died reports
    /// Degraded until the health monitor catches up.
    pub fn state(&self) -> ConnectionState {
        self.inner.effective_state()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> ClientStatus {
        let session = self.inner.current_session();
        ClientStatus {
            server_name: self.inner.server_name.clone(),
            state: self.state(),
            tools: session
                .as_ref()
                .map(|s| s.table().names())
                .unwrap_or_default(),
            server_info: session.as_ref().map(|s| s.server_info().clone()),
            pid: session.as_ref().and_then(|s| s.pid()),
            uptime_secs: session.as_ref().map(|s| s.age().as_secs()),
            idle_secs: session
                .as_ref()
                .and_then(|s| s.idle_for())
                .map(|d| d.as_secs()),
            indexed_repositories: self.indexed_repositories(),
            last_healthy: self.inner.last_healthy().map(|(_, at)| at),
        }
    }

    pub fn indexed_repositories(&self) -> Vec<String> {
        self.inner.lock_indexed().iter().cloned().collect()
    }

    pub fn is_repository_indexed(&self, repository: &str) -> bool {
        self.inner.lock_indexed().contains(repository)
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Clone and index a repository on the server.
    pub async fn index(&self, repository: &str) -> Result<Value, McpError> {
        let result = self
            .call_intent(OperationIntent::Index, logical(&[(args::REPOSITORY, json!(repository))]))
            .await?;
        self.inner.lock_indexed().insert(repository.to_string());
        Ok(result)
    }

    /// Natural-language search over an indexed repository.
    pub async fn search(
        &self,
        repository: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Value, McpError> {
        self.call_intent(
            OperationIntent::SemanticSearch,
            logical(&[
                (args::REPOSITORY, json!(repository)),
                (args::QUERY, json!(query)),
                (args::MAX_RESULTS, json!(max_results)),
            ]),
        )
        .await
    }

    /// Pattern search over repository code.
    pub async fn code_search(
        &self,
        repository: &str,
        pattern: &str,
        file_type: Option<&str>,
    ) -> Result<Value, McpError> {
        let mut arguments = logical(&[
            (args::REPOSITORY, json!(repository)),
            (args::PATTERN, json!(pattern)),
        ]);
        if let Some(file_type) = file_type {
            arguments.insert(args::FILE_TYPE.to_string(), json!(file_type));
        }
        self.call_intent(OperationIntent::CodeSearch, arguments).await
    }

    pub async fn read_file(&self, repository: &str, file_path: &str) -> Result<Value, McpError> {
        self.call_intent(
            OperationIntent::ReadFile,
            logical(&[
                (args::REPOSITORY, json!(repository)),
                (args::FILE_PATH, json!(file_path)),
            ]),
        )
        .await
    }

    pub async fn get_structure(&self, repository: &str) -> Result<Value, McpError> {
        self.call_intent(
            OperationIntent::GetStructure,
            logical(&[(args::REPOSITORY, json!(repository))]),
        )
        .await
    }

    /// Resolve `intent` against the current capability table and call it.
    ///
    /// Steps:
    /// 1. Fail fast unless Ready
    /// 2. Resolve the tool name and shape the arguments
    /// 3. Send `tools/call` with the intent's deadline
    pub async fn call_intent(
        &self,
        intent: OperationIntent,
        logical_args: Map<String, Value>,
    ) -> Result<Value, McpError> {
        let session = self.inner.ready_session()?;

        let tool = self.inner.resolver.resolve_tool(intent, session.table())?;
        let arguments = self.inner.resolver.build_arguments(&tool, intent, logical_args);

        let missing = session.table().missing_required(&tool, &arguments);
        if !missing.is_empty() {
            tracing::warn!(tool = %tool, intent = %intent, missing = ?missing, "arguments lack required parameters");
        }

        let timeout = self.inner.timeouts.for_intent(intent);
        let started = Instant::now();
        tracing::info!(tool = %tool, intent = %intent, timeout_ms = timeout.as_millis() as u64, "calling tool");

        let params = json!({ "name": tool, "arguments": arguments });
        match session
            .correlator()
            .call("tools/call", Some(params), timeout)
            .await
        {
            Ok(result) => {
                tracing::info!(
                    tool = %tool,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call completed"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(tool = %tool, error = %e, "tool call failed");
                if e.is_transport_failure() {
                    self.inner.lost.notify_one();
                }
                Err(e)
            }
        }
    }
}

fn logical(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ─── Inner ───────────────────────────────────────────────────────────────────

impl Inner {
    pub(super) fn published_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn effective_state(&self) -> ConnectionState {
        match self.published_state() {
            ConnectionState::Ready => match self.current_session() {
                Some(s) if s.is_alive() => ConnectionState::Ready,
                _ => ConnectionState::Degraded,
            },
            other => other,
        }
    }

    /// Publish `to` unless a disconnect has already claimed the state.
    fn transition(&self, to: ConnectionState) -> bool {
        let applied = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closing || *current == to {
                false
            } else {
                *current = to;
                true
            }
        });
        if applied {
            tracing::info!(server = %self.server_name, state = %to, "connection state changed");
        }
        applied
    }

    pub(super) fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ready_session(&self) -> Result<Arc<Session>, McpError> {
        let state = self.effective_state();
        if state != ConnectionState::Ready {
            return Err(McpError::NotConnected { state });
        }
        self.current_session()
            .ok_or(McpError::NotConnected { state: ConnectionState::Disconnected })
    }

    fn lock_indexed(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.indexed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn mark_healthy(&self) {
        *self
            .last_healthy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((Instant::now(), Utc::now()));
    }

    pub(super) fn last_healthy(&self) -> Option<(Instant, DateTime<Utc>)> {
        *self.last_healthy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once a disconnect has published `Closing`.
    async fn until_closing(&self) {
        let mut rx = self.state.subscribe();
        if rx.wait_for(|s| *s == ConnectionState::Closing).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Establish a session unless a disconnect intervenes.
    async fn establish(&self) -> Result<Session, McpError> {
        let timeouts = HandshakeTimeouts {
            init: self.timeouts.init(),
            discovery: self.timeouts.metadata(),
        };
        tokio::select! {
            result = Session::establish(
                &self.server_name,
                self.launcher.as_ref(),
                timeouts,
                Arc::clone(&self.lost),
            ) => result,
            _ = self.until_closing() => Err(McpError::NotConnected {
                state: ConnectionState::Closing,
            }),
        }
    }

    fn install(&self, session: Session) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(session));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.mark_healthy();
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn ensure_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *monitor = Some(health::spawn_monitor(
            Arc::downgrade(self),
            Arc::clone(&self.lost),
            self.health.probe_interval(),
        ));
    }

    async fn connect(self: &Arc<Self>) -> Result<(), McpError> {
        if let Some(reason) = &self.config_error {
            return Err(McpError::ConfigError {
                reason: reason.clone(),
            });
        }
        let _guard = self.lifecycle.lock().await;

        match self.published_state() {
            ConnectionState::Closing => {
                return Err(McpError::NotConnected {
                    state: ConnectionState::Closing,
                })
            }
            ConnectionState::Ready if self.effective_state() == ConnectionState::Ready => {
                return Ok(())
            }
            _ => {}
        }

        if let Some(old) = self.take_session() {
            old.shutdown("replaced by connect").await;
        }

        self.transition(ConnectionState::Connecting);
        match self.establish().await {
            Ok(session) => {
                self.install(session);
                self.transition(ConnectionState::Ready);
                self.ensure_monitor();
                Ok(())
            }
            Err(e) => {
                tracing::error!(server = %self.server_name, error = %e, "connect failed");
                self.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replace the session, retrying with exponential backoff.
    ///
    /// `observed` is the generation the caller judged unhealthy. If a newer
    /// session was installed while waiting for the lock the call returns
    /// without rebuilding, so concurrent requests collapse into one rebuild.
    pub(super) async fn reconnect(
        self: &Arc<Self>,
        observed: u64,
        reason: &str,
    ) -> Result<(), McpError> {
        let _guard = self.lifecycle.lock().await;

        if self.generation() != observed
            && self.effective_state() == ConnectionState::Ready
        {
            tracing::debug!(server = %self.server_name, "reconnect already completed by another caller");
            return Ok(());
        }
        if !self.transition(ConnectionState::Degraded)
            && self.published_state() == ConnectionState::Closing
        {
            return Err(McpError::NotConnected {
                state: ConnectionState::Closing,
            });
        }

        tracing::warn!(server = %self.server_name, reason, "reconnecting");
        if let Some(old) = self.take_session() {
            old.shutdown(reason).await;
        }

        let attempts = self.health.max_reconnect_attempts;
        for attempt in 1..=attempts {
            let delay = self.health.backoff(attempt);
            tracing::info!(
                server = %self.server_name,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect attempt scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.until_closing() => {
                    return Err(McpError::NotConnected { state: ConnectionState::Closing });
                }
            }

            match self.establish().await {
                Ok(session) => {
                    self.install(session);
                    self.transition(ConnectionState::Ready);
                    self.ensure_monitor();
                    tracing::info!(server = %self.server_name, attempt, "reconnected");
                    return Ok(());
                }
                Err(e @ McpError::NotConnected { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(server = %self.server_name, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        let err = McpError::RestartExhausted { attempts };
        tracing::error!(server = %self.server_name, error = %err, "giving up on server");
        self.transition(ConnectionState::Disconnected);
        Err(err)
    }

    async fn disconnect(&self) {
        // Published before taking the lock so a running reconnect aborts.
        let previous = self.state.send_replace(ConnectionState::Closing);
        tracing::info!(server = %self.server_name, previous = %previous, "disconnecting");

        let _guard = self.lifecycle.lock().await;
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        if let Some(session) = self.take_session() {
            session.shutdown("disconnect requested").await;
        }
        self.lock_indexed().clear();
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(server = %self.server_name, "disconnected");
    }

    fn abandon(&self) {
        self.state.send_replace(ConnectionState::Closing);
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        if let Some(session) = self.take_session() {
            session.kill("client abandoned");
        }
        self.lock_indexed().clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Time since the last successful probe or session install.
    pub(super) fn since_healthy(&self) -> Option<Duration> {
        self.last_healthy().map(|(at, _)| at.elapsed())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
