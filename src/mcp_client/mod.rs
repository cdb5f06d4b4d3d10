//! MCP Client — connections to external MCP servers.
//!
//! This module handles:
//! - Spawning stdio servers and connecting to SSE / streamable-HTTP servers
//! - JSON-RPC 2.0 framing, request correlation, and the initialize handshake
//! - The per-server lifecycle (connect, crash detection, restart with backoff)
//! - Orchestrating every configured server through [`McpManager`]
//!
//! Tools and resources discovered here are exposed to the host through
//! [`crate::bridge`].

pub mod client;
pub mod config;
pub mod errors;
pub mod http_transport;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{restart_delay, Connection, Connector, ServerClient, SupervisedClient, Teardown};
pub use config::{McpServersConfig, ServerSpec, TransportKind};
pub use errors::McpError;
pub use manager::{default_factory, ClientFactory, McpManager, ServerStatus};
pub use process::{ProcessClient, ProcessConnector};
pub use stream::{StreamClient, StreamConnector};
pub use types::{CallToolResult, ClientState, ContentItem, ResourceContents, ResourceDescriptor, ToolDescriptor};
