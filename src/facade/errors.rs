//! Facade error types: the categorized failures callers see.

use serde::Serialize;
use thiserror::Error;

use crate::mcp_client::{ConnectionState, McpError, OperationIntent};

/// Failure of a facade operation, classified for the caller.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResearchError {
    /// The server could not be started; fatal until reconfigured.
    #[error("server could not be started: {message}")]
    Launch { message: String },

    /// The pipe to the server broke or carried garbage.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// The call exceeded its deadline; retryable.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The server rejected the call.
    #[error("server error [{code}]: {message}")]
    Remote { code: i32, message: String },

    /// The server build exposes no tool for this operation.
    #[error("no tool available for {intent} (tried: {})", tried.join(", "))]
    ToolNotAvailable {
        intent: OperationIntent,
        tried: Vec<String>,
    },

    /// The connection dropped while the call was in flight.
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    /// The call was made while the connection was not Ready.
    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// Bad or missing configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl From<McpError> for ResearchError {
    fn from(e: McpError) -> Self {
        let message = e.to_string();
        match e {
            McpError::LaunchFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::RestartExhausted { .. } => ResearchError::Launch { message },
            McpError::BrokenPipe { .. }
            | McpError::ProcessExited { .. }
            | McpError::Protocol { .. } => ResearchError::Transport { message },
            McpError::Timeout { method, timeout_ms } => ResearchError::Timeout {
                operation: method,
                timeout_ms,
            },
            McpError::Remote { code, message, .. } => ResearchError::Remote { code, message },
            McpError::ToolNotAvailable { intent, tried } => {
                ResearchError::ToolNotAvailable { intent, tried }
            }
            McpError::ConnectionLost { reason } => ResearchError::ConnectionLost { message: reason },
            McpError::NotConnected { state } => ResearchError::NotConnected { state },
            McpError::ConfigError { reason } => ResearchError::Config { message: reason },
        }
    }
}

impl ResearchError {
    /// Whether retrying the same call later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::Timeout { .. } | ResearchError::ConnectionLost { .. }
        )
    }

    /// A short suggestion for the user, when one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ResearchError::Remote { message, .. } if message.to_lowercase().contains("index") => {
                Some("The repository may not be indexed yet. Index it first, then retry.")
            }
            ResearchError::Launch { message } if message.contains("not found") => {
                Some("Install uv (for example `pip install uv`) so that `uvx` is on PATH.")
            }
            ResearchError::Launch { message } if message.contains("GITHUB_TOKEN") => {
                Some("Set GITHUB_TOKEN in your .env file to a real GitHub token.")
            }
            ResearchError::Config { .. } => {
                Some("Check the configuration file and the .env file, then reconnect.")
            }
            ResearchError::NotConnected { .. } => Some("Connect to the server first."),
            ResearchError::ToolNotAvailable { .. } => Some(
                "This server build does not offer the operation; add its tool name as an alias in the resolver configuration.",
            ),
            ResearchError::ConnectionLost { .. } => {
                Some("The server is restarting. Retry once the connection is ready.")
            }
            ResearchError::Timeout { .. } => {
                Some("Indexing and searching large repositories can take minutes; retry or raise the timeout.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let e: ResearchError = McpError::BrokenPipe {
            reason: "closed".into(),
        }
        .into();
        assert!(matches!(e, ResearchError::Transport { .. }));

        let e: ResearchError = McpError::Timeout {
            method: "tools/call".into(),
            timeout_ms: 5,
        }
        .into();
        assert!(e.is_retryable());

        let e: ResearchError = McpError::NotConnected {
            state: ConnectionState::Degraded,
        }
        .into();
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("degraded"));
    }

    #[test]
    fn test_remote_index_hint() {
        let e = ResearchError::Remote {
            code: -32000,
            message: "Index not found for repository".into(),
        };
        assert!(e.hint().unwrap().contains("Index it first"));

        let e = ResearchError::Remote {
            code: -32000,
            message: "rate limited".into(),
        };
        assert!(e.hint().is_none());
    }

    #[test]
    fn test_launch_hints() {
        let e: ResearchError = McpError::LaunchFailed {
            command: "uvx".into(),
            reason: "executable not found: No such file or directory".into(),
        }
        .into();
        assert!(e.hint().unwrap().contains("uv"));
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let e = ResearchError::ToolNotAvailable {
            intent: OperationIntent::Index,
            tried: vec!["index_repository".into()],
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "tool_not_available");
        assert_eq!(json["intent"], "index");
        assert_eq!(json["tried"][0], "index_repository");
    }
}
