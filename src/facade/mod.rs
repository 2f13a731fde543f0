//! Synchronous facade over [`McpClient`].
//!
//! [`ResearchClient`] owns a dedicated background runtime that runs the
//! receive loops, the health monitor and every protocol call. Each facade
//! method spawns its work onto that runtime and blocks only the calling
//! thread until the reply arrives, so concurrent callers never block each
//! other or the protocol machinery.

pub mod errors;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::config::ClientConfig;
use crate::mcp_client::{ConnectionState, Launcher, McpClient, McpError, ServerInfo};

pub use errors::ResearchError;

/// Worker threads for the background runtime.
const BACKGROUND_WORKERS: usize = 2;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Connection summary for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub server_name: String,
    pub state: ConnectionState,
    pub tools: Vec<String>,
    pub tool_count: u32,
    pub server_info: Option<ServerInfo>,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub idle_secs: Option<u64>,
    pub indexed_repositories: Vec<String>,
    pub last_healthy: Option<String>,
    pub last_check: String,
}

// ─── ResearchClient ──────────────────────────────────────────────────────────

/// Blocking entry point for the UI.
///
/// Must be used from outside an async runtime; inside one, use
/// [`McpClient`] directly. Dropped inside a runtime, it skips the graceful
/// disconnect and only kills the server.
pub struct ResearchClient {
    /// Taken only by `Drop`.
    runtime: Option<Runtime>,
    client: McpClient,
}

impl ResearchClient {
    /// Build a client for the configured server. Does not connect.
    pub fn start(config: &ClientConfig) -> Result<Self, ResearchError> {
        Self::with_launcher(config, config.build_launcher())
    }

    /// Build a client around a custom launcher.
    pub fn with_launcher(
        config: &ClientConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, ResearchError> {
        config.check()?;
        for issue in config.validate() {
            tracing::warn!(issue = %issue, "configuration issue");
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(BACKGROUND_WORKERS)
            .thread_name("reposcope-bg")
            .enable_all()
            .build()
            .map_err(|e| ResearchError::Launch {
                message: format!("failed to start background runtime: {e}"),
            })?;

        Ok(Self {
            runtime: Some(runtime),
            client: McpClient::with_launcher(config, launcher),
        })
    }

    /// The async client underneath, for callers that have a runtime.
    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Run `op` on the background runtime and wait for its result.
    fn run<T, F, Fut>(&self, op: F) -> Result<T, ResearchError>
    where
        F: FnOnce(McpClient) -> Fut,
        Fut: Future<Output = Result<T, McpError>> + Send + 'static,
        T: Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ResearchError::Config {
                message: "ResearchClient was called from inside an async runtime".into(),
            });
        }

        let Some(runtime) = self.runtime.as_ref() else {
            return Err(ResearchError::ConnectionLost {
                message: "background runtime is shut down".into(),
            });
        };

        let (tx, rx) = oneshot::channel();
        let work = op(self.client.clone());
        runtime.spawn(async move {
            let _ = tx.send(work.await);
        });

        match rx.blocking_recv() {
            Ok(result) => result.map_err(ResearchError::from),
            Err(_) => Err(ResearchError::ConnectionLost {
                message: "background task ended without a reply".into(),
            }),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    pub fn connect(&self) -> Result<(), ResearchError> {
        self.run(|c| async move { c.connect().await })
    }

    pub fn disconnect(&self) -> Result<(), ResearchError> {
        self.run(|c| async move {
            c.disconnect().await;
            Ok(())
        })
    }

    pub fn reconnect(&self) -> Result<(), ResearchError> {
        self.run(|c| async move { c.reconnect().await })
    }

    // ─── Operations ──────────────────────────────────────────────────────

    pub fn index(&self, repository: &str) -> Result<serde_json::Value, ResearchError> {
        let repository = repository.to_string();
        self.run(|c| async move { c.index(&repository).await })
    }

    pub fn search(
        &self,
        repository: &str,
        query: &str,
        max_results: u32,
    ) -> Result<serde_json::Value, ResearchError> {
        let (repository, query) = (repository.to_string(), query.to_string());
        self.run(move |c| async move { c.search(&repository, &query, max_results).await })
    }

    pub fn code_search(
        &self,
        repository: &str,
        pattern: &str,
        file_type: Option<&str>,
    ) -> Result<serde_json::Value, ResearchError> {
        let (repository, pattern) = (repository.to_string(), pattern.to_string());
        let file_type = file_type.map(str::to_string);
        self.run(move |c| async move {
            c.code_search(&repository, &pattern, file_type.as_deref())
                .await
        })
    }

    pub fn read_file(
        &self,
        repository: &str,
        file_path: &str,
    ) -> Result<serde_json::Value, ResearchError> {
        let (repository, file_path) = (repository.to_string(), file_path.to_string());
        self.run(move |c| async move { c.read_file(&repository, &file_path).await })
    }

    pub fn get_structure(&self, repository: &str) -> Result<serde_json::Value, ResearchError> {
        let repository = repository.to_string();
        self.run(|c| async move { c.get_structure(&repository).await })
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn connection_status(&self) -> ConnectionStatus {
        let status = self.client.status();
        ConnectionStatus {
            server_name: status.server_name,
            state: status.state,
            tool_count: status.tools.len() as u32,
            tools: status.tools,
            server_info: status.server_info,
            pid: status.pid,
            uptime_secs: status.uptime_secs,
            idle_secs: status.idle_secs,
            indexed_repositories: status.indexed_repositories,
            last_healthy: status.last_healthy.map(|t| t.to_rfc3339()),
            last_check: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn indexed_repositories(&self) -> Vec<String> {
        self.client.indexed_repositories()
    }

    pub fn is_repository_indexed(&self, repository: &str) -> bool {
        self.client.is_repository_indexed(repository)
    }
}

impl Drop for ResearchClient {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking here would panic.
            tracing::warn!("research client dropped inside an async runtime; killing server");
            self.client.abandon();
            runtime.shutdown_background();
            return;
        }
        let client = self.client.clone();
        runtime.block_on(async move { client.disconnect().await });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
