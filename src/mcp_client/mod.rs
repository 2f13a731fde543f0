//! MCP client: JSON-RPC over stdio to a repository research server.
//!
//! This module handles:
//! - Spawning and stopping the server child process
//! - JSON-RPC 2.0 request/response correlation over process stdio
//! - The MCP handshake and tool discovery
//! - Resolving abstract operations to whatever tool names the server exposes
//! - Health probing with automatic, bounded reconnect
//!
//! [`McpClient`] is the async entry point; the synchronous facade in
//! [`crate::facade`] wraps it for callers outside a runtime.

pub mod client;
pub mod correlator;
pub mod errors;
mod health;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{ClientStatus, McpClient};
pub use errors::McpError;
pub use registry::CapabilityTable;
pub use resolver::{ParamRule, Resolver, ToolOverride};
pub use transport::{Launcher, ProcessLauncher, Transport};
pub use types::{ConnectionState, OperationIntent, ServerConfig, ServerInfo, ToolDescriptor};
