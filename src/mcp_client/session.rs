//! One established connection: a running transport that completed the MCP
//! handshake, plus the capability table it advertised.
//!
//! A session is never published until `establish` returns, so no operation
//! request can reach a server that has not finished initializing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::correlator::Correlator;
use super::errors::McpError;
use super::registry::CapabilityTable;
use super::transport::{Launcher, Transport, TransportEvent, TransportHandle};
use super::types::{InitializeResult, ServerInfo, PROTOCOL_VERSION};

/// Deadlines used while establishing a session.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    /// Budget for the `initialize` request.
    pub init: Duration,
    /// Budget for the `tools/list` request.
    pub discovery: Duration,
}

/// A ready-to-use connection to one server instance.
pub struct Session {
    server_name: String,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    table: CapabilityTable,
    server_info: ServerInfo,
    protocol_version: Option<String>,
    receive_task: ReceiveTask,
    established_at: Instant,
    _teardown: KillOnDrop,
}

/// Aborts the receive loop when dropped, including when `establish` is
/// cancelled before the session exists.
struct ReceiveTask(JoinHandle<()>);

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Kills the launched server when dropped. Armed from the moment `launch`
/// returns, so a cancelled handshake or a session dropped without
/// `shutdown` never leaves the process running.
struct KillOnDrop(Arc<dyn Transport>);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if self.0.is_alive() {
            self.0.start_kill();
        }
    }
}

impl Session {
    /// Launch a server, run the handshake and discover its tools.
    ///
    /// `lost` is notified when the receive loop observes the process exit.
    pub async fn establish(
        server_name: &str,
        launcher: &dyn Launcher,
        timeouts: HandshakeTimeouts,
        lost: Arc<Notify>,
    ) -> Result<Self, McpError> {
        tracing::info!(server = server_name, command = %launcher.describe(), "launching server");
        let TransportHandle { transport, events } = launcher.launch().await?;
        let teardown = KillOnDrop(Arc::clone(&transport));

        let correlator = Arc::new(Correlator::new(server_name, Arc::clone(&transport)));
        let receive_task = ReceiveTask(tokio::spawn(receive_loop(
            server_name.to_string(),
            events,
            Arc::clone(&correlator),
            lost,
        )));

        let init = match initialize(&correlator, timeouts.init).await {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!(server = server_name, error = %e, "initialize failed");
                correlator.fail_all("initialization failed");
                drop(receive_task);
                transport.stop().await;
                return Err(McpError::InitFailed {
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = correlator.notify("notifications/initialized", None).await {
            correlator.fail_all("initialization failed");
            drop(receive_task);
            transport.stop().await;
            return Err(McpError::InitFailed {
                reason: format!("failed to send initialized notification: {e}"),
            });
        }

        let table = discover_tools(server_name, &correlator, timeouts.discovery).await;

        let server_info = init.server_info.unwrap_or_default();
        tracing::info!(
            server = server_name,
            remote_name = server_info.name.as_deref().unwrap_or("unknown"),
            remote_version = server_info.version.as_deref().unwrap_or("unknown"),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            tools = table.len(),
            pid = ?transport.pid(),
            "session established"
        );

        Ok(Self {
            server_name: server_name.to_string(),
            transport,
            correlator,
            table,
            server_info,
            protocol_version: init.protocol_version,
            receive_task,
            established_at: Instant::now(),
            _teardown: teardown,
        })
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn table(&self) -> &CapabilityTable {
        &self.table
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Time since the server last produced output, when the transport
    /// tracks it.
    pub fn idle_for(&self) -> Option<Duration> {
        self.transport.idle_for()
    }

    /// Process running, receive loop running, correlator open.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
            && !self.receive_task.0.is_finished()
            && !self.correlator.is_closed()
    }

    /// Like `shutdown`, but only signals the process instead of waiting for
    /// it to exit.
    pub fn kill(&self, reason: &str) {
        tracing::info!(server = %self.server_name, reason, "killing session");
        self.correlator.fail_all(reason);
        self.receive_task.0.abort();
        self.transport.start_kill();
    }

    /// Fail in-flight requests and stop the server process.
    pub async fn shutdown(&self, reason: &str) {
        tracing::info!(server = %self.server_name, reason, "closing session");
        self.correlator.fail_all(reason);
        self.receive_task.0.abort();
        self.transport.stop().await;
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

async fn initialize(
    correlator: &Correlator,
    timeout: Duration,
) -> Result<InitializeResult, McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let result = correlator.call("initialize", Some(params), timeout).await?;
    serde_json::from_value(result).map_err(|e| McpError::Protocol {
        reason: format!("failed to parse initialize response: {e}"),
    })
}

/// Fetch the tool list; any failure yields a capability-less table.
async fn discover_tools(
    server_name: &str,
    correlator: &Correlator,
    timeout: Duration,
) -> CapabilityTable {
    let result = match correlator.call("tools/list", None, timeout).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(server = server_name, error = %e, "tool discovery failed");
            return CapabilityTable::empty();
        }
    };
    match CapabilityTable::from_list_response(result) {
        Ok(table) => {
            tracing::debug!(server = server_name, tools = ?table.names(), "discovered tools");
            table
        }
        Err(e) => {
            tracing::warn!(server = server_name, error = %e, "discarding tool list");
            CapabilityTable::empty()
        }
    }
}

// ─── Receive Loop ────────────────────────────────────────────────────────────

async fn receive_loop(
    server_name: String,
    mut events: mpsc::Receiver<TransportEvent>,
    correlator: Arc<Correlator>,
    lost: Arc<Notify>,
) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Message(line)) => correlator.dispatch(&line),
            Some(TransportEvent::Exited(code)) => {
                break format!(
                    "process exited (code: {})",
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                );
            }
            None => break "transport closed".to_string(),
        }
    };

    tracing::warn!(server = %server_name, reason = %reason, "receive loop ended");
    correlator.fail_all(&reason);
    lost.notify_one();
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::MockLauncher;

    fn timeouts() -> HandshakeTimeouts {
        HandshakeTimeouts {
            init: Duration::from_millis(500),
            discovery: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_establish_runs_handshake_and_discovery() {
        let launcher = MockLauncher::with_tools(&["create_research_repository", "search"]);
        let session = Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new()))
            .await
            .unwrap();

        assert!(session.is_alive());
        assert_eq!(
            session.table().names(),
            vec!["create_research_repository", "search"]
        );
        assert_eq!(session.server_info().name.as_deref(), Some("mock-research"));
        assert_eq!(session.protocol_version(), Some(PROTOCOL_VERSION));

        // initialize, then the initialized notification, then tools/list.
        let methods = launcher.received_methods();
        assert_eq!(
            &methods[..3],
            &["initialize", "notifications/initialized", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_init_timeout_is_init_failed_and_stops_process() {
        let launcher = MockLauncher::with_tools(&["search"]).hang_on("initialize");
        let result =
            Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new())).await;
        assert!(matches!(result, Err(McpError::InitFailed { .. })));
        assert_eq!(launcher.live_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_discovery_gives_capability_less_session() {
        let launcher = MockLauncher::with_tools(&["search"]).fail_method("tools/list");
        let session = Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert!(session.table().is_empty());
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_malformed_tool_list_gives_empty_table() {
        let launcher = MockLauncher::with_raw_tools(serde_json::json!({
            "tools": [{"name": "search"}, {"description": "nameless"}]
        }));
        let session = Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert!(session.table().is_empty());
    }

    #[tokio::test]
    async fn test_process_exit_notifies_lost_and_fails_pending() {
        let launcher = MockLauncher::with_tools(&["search"]).hang_on("tools/call");
        let lost = Arc::new(Notify::new());
        let session = Session::establish("research", &launcher, timeouts(), Arc::clone(&lost))
            .await
            .unwrap();

        let correlator = Arc::clone(session.correlator());
        let pending = tokio::spawn(async move {
            correlator
                .call("tools/call", None, Duration::from_secs(30))
                .await
        });
        launcher.wait_for_method("tools/call").await;

        launcher.kill_all();
        tokio::time::timeout(Duration::from_secs(2), lost.notified())
            .await
            .unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(McpError::ConnectionLost { .. })
        ));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_shutdown_stops_transport() {
        let launcher = MockLauncher::with_tools(&["search"]);
        let session = Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(launcher.live_count(), 1);
        session.shutdown("test").await;
        assert_eq!(launcher.live_count(), 0);
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_cancelled_establish_kills_server() {
        let launcher = MockLauncher::with_tools(&["search"]).hang_on("initialize");
        let slow = HandshakeTimeouts {
            init: Duration::from_secs(30),
            discovery: Duration::from_secs(30),
        };
        let establish = Session::establish("research", &launcher, slow, Arc::new(Notify::new()));
        tokio::select! {
            _ = establish => panic!("handshake should hang"),
            _ = launcher.wait_for_method("initialize") => {}
        }
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(launcher.live_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_kills_server() {
        let launcher = MockLauncher::with_tools(&["search"]);
        let session = Session::establish("research", &launcher, timeouts(), Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(launcher.live_count(), 1);
        drop(session);
        assert_eq!(launcher.live_count(), 0);
    }
}
