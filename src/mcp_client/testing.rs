//! In-memory stand-ins for the server process, used by unit tests.
//!
//! [`MockLauncher`] starts scripted MCP servers that answer the handshake,
//! `tools/list`, `ping` and `tools/call` (echoing the tool name and
//! arguments back). Individual methods can be made to hang or return an
//! error, and every instance can be killed to simulate a crash.
//! [`RecordingTransport`] only records what was sent, for correlator tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::errors::McpError;
use super::transport::{Launcher, Transport, TransportEvent, TransportHandle};
use super::types::{error_codes, PROTOCOL_VERSION};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ─── RecordingTransport ──────────────────────────────────────────────────────

/// Transport that records every sent message and never answers.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Value>>,
    broken: AtomicBool,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make every later send fail with `BrokenPipe`.
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Wait until `n` requests (messages with an id) have been sent.
    pub async fn wait_for_requests(&self, n: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let requests: Vec<Value> = self
                .sent()
                .into_iter()
                .filter(|m| m.get("id").is_some())
                .collect();
            if requests.len() >= n {
                return requests;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of {n} requests sent",
                requests.len()
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: String) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.broken.load(Ordering::SeqCst) {
                return Err(McpError::BrokenPipe {
                    reason: "test pipe closed".into(),
                });
            }
            let value: Value = serde_json::from_str(&message).unwrap();
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn is_alive(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

// ─── MockLauncher ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    tools: Value,
    hang: HashSet<String>,
    fail: HashSet<String>,
    received: Vec<String>,
    instances: Vec<Arc<MockServer>>,
    launch_delay: Duration,
    failing_launches: u32,
}

/// Launches scripted in-memory MCP servers. Clones share one script.
#[derive(Clone, Default)]
pub struct MockLauncher {
    script: Arc<Mutex<Script>>,
    launches: Arc<AtomicU32>,
}

impl MockLauncher {
    /// Servers advertising the given tool names with an empty schema.
    pub fn with_tools(names: &[&str]) -> Self {
        let tools: Vec<Value> = names
            .iter()
            .map(|n| json!({"name": n, "description": format!("{n} tool"), "inputSchema": {"type": "object"}}))
            .collect();
        Self::with_raw_tools(json!({ "tools": tools }))
    }

    /// Servers answering `tools/list` with exactly `result`.
    pub fn with_raw_tools(result: Value) -> Self {
        let launcher = Self::default();
        launcher.script().tools = result;
        launcher
    }

    /// Never answer `method`.
    pub fn hang_on(self, method: &str) -> Self {
        self.script().hang.insert(method.to_string());
        self
    }

    /// Answer `method` with a JSON-RPC error.
    pub fn fail_method(self, method: &str) -> Self {
        self.script().fail.insert(method.to_string());
        self
    }

    pub fn launch_delay(self, delay: Duration) -> Self {
        self.script().launch_delay = delay;
        self
    }

    /// Make the next `n` launches fail.
    pub fn fail_launches(&self, n: u32) {
        self.script().failing_launches = n;
    }

    pub fn stop_hanging(&self, method: &str) {
        self.script().hang.remove(method);
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Instances whose process has not exited or been stopped.
    pub fn live_count(&self) -> usize {
        self.script()
            .instances
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }

    /// Methods received across all instances, in arrival order.
    pub fn received_methods(&self) -> Vec<String> {
        self.script().received.clone()
    }

    /// Simulate every live server process crashing.
    pub fn kill_all(&self) {
        let instances = self.script().instances.clone();
        for server in instances {
            server.exit(Some(1));
        }
    }

    pub async fn wait_for_method(&self, method: &str) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while !self.script().received.iter().any(|m| m == method) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "'{method}' never received"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Launcher for MockLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<TransportHandle, McpError>> {
        Box::pin(async move {
            let delay = self.script().launch_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;

            {
                let mut script = self.script();
                if script.failing_launches > 0 {
                    script.failing_launches -= 1;
                    return Err(McpError::LaunchFailed {
                        command: "mock".into(),
                        reason: "scripted launch failure".into(),
                    });
                }
            }

            let (tx, events) = mpsc::channel(64);
            let server = Arc::new(MockServer {
                pid: 1000 + n,
                script: Arc::clone(&self.script),
                tx: Mutex::new(Some(tx)),
                alive: AtomicBool::new(true),
            });
            self.script().instances.push(Arc::clone(&server));
            Ok(TransportHandle {
                transport: server,
                events,
            })
        })
    }

    fn describe(&self) -> String {
        "mock research server".to_string()
    }
}

// ─── MockServer ──────────────────────────────────────────────────────────────

struct MockServer {
    pid: u32,
    script: Arc<Mutex<Script>>,
    tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    alive: AtomicBool,
}

impl MockServer {
    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn exit(&self, code: Option<i32>) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.try_send(TransportEvent::Exited(code));
        }
    }

    fn respond(&self, request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?.to_string();
        let script = self.script.lock().unwrap_or_else(PoisonError::into_inner);

        if script.hang.contains(&method) {
            return None;
        }
        if script.fail.contains(&method) {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": error_codes::METHOD_NOT_FOUND, "message": format!("{method} not supported")}
            }));
        }

        let result = match method.as_str() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-research", "version": "0.0.1"}
            }),
            "tools/list" => script.tools.clone(),
            "ping" => json!({}),
            "tools/call" => {
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                json!({
                    "tool": params.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": params.get("arguments").cloned().unwrap_or(Value::Null),
                })
            }
            _ => {
                return Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": error_codes::METHOD_NOT_FOUND, "message": "Method not found"}
                }))
            }
        };
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

impl Transport for MockServer {
    fn send(&self, message: String) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(McpError::ProcessExited { code: Some(1) });
            }
            let request: Value = serde_json::from_str(&message).map_err(|e| McpError::Protocol {
                reason: e.to_string(),
            })?;
            if let Some(method) = request.get("method").and_then(Value::as_str) {
                self.script
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .received
                    .push(method.to_string());
            }

            if let Some(reply) = self.respond(&request) {
                if let Some(tx) = self.sender() {
                    let _ = tx.send(TransportEvent::Message(reply.to_string())).await;
                }
            }
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.exit(Some(0)) })
    }

    fn start_kill(&self) {
        self.exit(None);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
