//! Connects an agent host to external MCP tool servers.
//!
//! - [`mcp_client`]: transports, the per-server lifecycle, and [`McpManager`]
//! - [`bridge`]: discovered tools and resources adapted for the host, with
//!   all server output wrapped as untrusted content
//! - [`credentials`]: `secret://` references in server env vars and headers
//! - [`logging`]: tracing subscriber setup
//!
//! ```no_run
//! # async fn run() -> Result<(), mcp_bridge::McpError> {
//! use mcp_bridge::{McpManager, McpServersConfig};
//!
//! let config = McpServersConfig::load(std::path::Path::new("mcp-servers.json"))?;
//! let manager = McpManager::new(config.into_specs());
//! for (server, error) in manager.start().await {
//!     eprintln!("{server}: {error}");
//! }
//!
//! let tools = manager.get_tools().await;
//! let context = manager.get_resource_context().await;
//! # let _ = (tools, context);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod credentials;
pub mod logging;
pub mod mcp_client;

pub use bridge::{BridgedTool, ToolDefinition, ToolOutput};
pub use credentials::{CredentialError, CredentialResolver, SecretProvider};
pub use mcp_client::{
    ClientState, McpError, McpManager, McpServersConfig, ProcessClient, ServerClient, ServerSpec,
    ServerStatus, StreamClient, TransportKind,
};
