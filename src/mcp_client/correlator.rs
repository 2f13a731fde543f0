//! Request/response correlation over a shared, multiplexed stream.
//!
//! Every outgoing request gets a fresh id and a pending entry holding a
//! oneshot sender. The session's receive loop feeds each stdout line to
//! [`Correlator::dispatch`], which completes the entry with the matching id.
//! Entries are removed exactly once: by their response, by their deadline,
//! by the caller dropping the future, or by [`Correlator::fail_all`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::errors::McpError;
use super::transport::Transport;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// One in-flight request.
struct PendingRequest {
    method: String,
    issued_at: Instant,
    slot: oneshot::Sender<Result<serde_json::Value, McpError>>,
}

/// Joins requests to responses by id for one transport.
pub struct Correlator {
    server_name: String,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Removes a pending entry if the awaiting future is dropped early.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.take(self.id);
    }
}

impl Correlator {
    pub fn new(server_name: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            server_name: server_name.to_string(),
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Send `method` and wait for its response, at most `timeout`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        if self.is_closed() {
            return Err(self.lost("connection already closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let issued_at = Instant::now();
        let deadline = tokio::time::Instant::from_std(issued_at + timeout);
        let (tx, rx) = oneshot::channel();

        self.lock_pending().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at,
                slot: tx,
            },
        );
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        // fail_all may have run between the closed check and the insert.
        if self.is_closed() {
            return Err(self.lost("connection closed while sending"));
        }

        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(
            |e| McpError::Protocol {
                reason: format!("failed to serialize request: {e}"),
            },
        )?;

        tracing::debug!(server = %self.server_name, id, method, "sending request");
        self.transport.send(json).await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.lost("pending request dropped")),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method,
                    timeout_ms,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.lost("connection already closed"));
        }
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(
            |e| McpError::Protocol {
                reason: format!("failed to serialize notification: {e}"),
            },
        )?;
        self.transport.send(json).await
    }

    /// Route one line of server output to the pending request it answers.
    pub fn dispatch(&self, line: &str) {
        let message = match serde_json::from_str::<JsonRpcResponse>(line) {
            Ok(m) => m,
            Err(_) => {
                // Not JSON-RPC: servers sometimes log to stdout.
                tracing::debug!(server = %self.server_name, line, "ignoring non-JSON-RPC output");
                return;
            }
        };

        if message.is_server_message() {
            tracing::debug!(
                server = %self.server_name,
                method = message.method.as_deref().unwrap_or_default(),
                "ignoring server-initiated message"
            );
            return;
        }

        let Some(id) = message.correlation_id() else {
            tracing::warn!(server = %self.server_name, line, "dropping response without usable id");
            return;
        };

        let Some(entry) = self.take(id) else {
            tracing::warn!(
                server = %self.server_name,
                id,
                "dropping response for unknown request id"
            );
            return;
        };

        tracing::debug!(
            server = %self.server_name,
            id,
            method = %entry.method,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "response received"
        );

        // The caller may have given up already; that is fine.
        let _ = entry.slot.send(extract_result(message));
    }

    /// Close the correlator and fail every pending request with `ConnectionLost`.
    pub fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(u64, PendingRequest)> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            tracing::warn!(
                server = %self.server_name,
                count = drained.len(),
                reason,
                "failing in-flight requests"
            );
        }
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(self.lost(reason)));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.lock_pending().remove(&id)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lost(&self, reason: &str) -> McpError {
        McpError::ConnectionLost {
            reason: format!("{} ({reason})", self.server_name),
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::Protocol {
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
