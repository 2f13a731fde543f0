//! MCP Client error types.

use thiserror::Error;

use super::types::{ConnectionState, OperationIntent};

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process could not be started, or exited right away.
    #[error("failed to launch '{command}': {reason}")]
    LaunchFailed {
        command: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server initialization failed: {reason}")]
    InitFailed {
        reason: String,
    },

    /// The server's stdin is closed or a write failed.
    #[error("broken pipe to server: {reason}")]
    BrokenPipe {
        reason: String,
    },

    /// The server process has exited.
    #[error("server process exited (code: {})", fmt_exit_code(code))]
    ProcessExited {
        code: Option<i32>,
    },

    /// A single call exceeded its deadline.
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No alias for the intent is present in the capability table.
    #[error("no tool available for {intent} (tried: {})", tried.join(", "))]
    ToolNotAvailable {
        intent: OperationIntent,
        tried: Vec<String>,
    },

    /// The connection dropped while the call was in flight.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        reason: String,
    },

    /// A call was attempted while the connection was not Ready.
    #[error("not connected (state: {state})")]
    NotConnected {
        state: ConnectionState,
    },

    /// Malformed message that could not be encoded or decoded.
    #[error("protocol error: {reason}")]
    Protocol {
        reason: String,
    },

    /// Configuration error (missing command, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All reconnect attempts exhausted.
    #[error("server failed after {attempts} reconnect attempts")]
    RestartExhausted {
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error means the transport underneath is gone.
    ///
    /// The health monitor is woken for these so recovery starts without
    /// waiting for the next probe tick.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::BrokenPipe { .. }
                | McpError::ProcessExited { .. }
                | McpError::ConnectionLost { .. }
        )
    }
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_not_available_lists_aliases() {
        let err = McpError::ToolNotAvailable {
            intent: OperationIntent::Index,
            tried: vec!["index_repository".into(), "clone_and_index".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("index"));
        assert!(msg.contains("index_repository, clone_and_index"));
    }

    #[test]
    fn test_process_exited_display() {
        let err = McpError::ProcessExited { code: Some(2) };
        assert_eq!(err.to_string(), "server process exited (code: 2)");
        let err = McpError::ProcessExited { code: None };
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_is_transport_failure() {
        assert!(McpError::BrokenPipe { reason: "x".into() }.is_transport_failure());
        assert!(McpError::ConnectionLost { reason: "x".into() }.is_transport_failure());
        assert!(!McpError::Timeout {
            method: "ping".into(),
            timeout_ms: 10,
        }
        .is_transport_failure());
        assert!(!McpError::NotConnected {
            state: ConnectionState::Degraded,
        }
        .is_transport_failure());
    }
}
