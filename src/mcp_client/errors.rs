//! MCP Client error types.

use thiserror::Error;

use crate::credentials::CredentialError;

use super::types::ClientState;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server specification is missing a field its transport requires,
    /// or a configuration file could not be parsed.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A `secret://` reference in the server's env or headers did not resolve.
    #[error("server '{server}' credential resolution failed: {source}")]
    CredentialFailed {
        server: String,
        #[source]
        source: CredentialError,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake or capability discovery failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// The network transport could not be established.
    #[error("failed to connect to server '{name}': {reason}")]
    ConnectFailed {
        name: String,
        reason: String,
    },

    /// Connect, handshake, and discovery did not finish in time.
    #[error("server '{name}' did not become ready within {timeout_ms}ms")]
    ConnectTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server process exited or the stream dropped while in use.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// An operation needing a live transport was issued outside `ready`.
    #[error("server '{name}' is not ready (state: {state})")]
    NotReady {
        name: String,
        state: ClientState,
    },

    /// A tool call timed out.
    #[error("tool call '{tool}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The tool call reply was malformed.
    #[error("tool '{tool}' on server '{server}' failed: {reason}")]
    ToolFailed {
        server: String,
        tool: String,
        reason: String,
    },

    /// A single resource could not be read.
    #[error("failed to read resource '{uri}' from server '{server}': {reason}")]
    ResourceReadFailed {
        server: String,
        uri: String,
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },

    /// No ready server exposes a tool with this external name.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },
}

impl McpError {
    /// Whether this error means the underlying connection is gone (as opposed
    /// to a single request failing on a healthy connection).
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::ServerCrashed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_message_names_state() {
        let err = McpError::NotReady {
            name: "filesystem".into(),
            state: ClientState::Connecting,
        };
        assert_eq!(
            err.to_string(),
            "server 'filesystem' is not ready (state: connecting)"
        );
    }

    #[test]
    fn test_timeout_message_names_server_and_tool() {
        let err = McpError::Timeout {
            server: "remote".into(),
            tool: "search".into(),
            timeout_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("remote"));
        assert!(msg.contains("search"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_transport_fault_classification() {
        assert!(McpError::ServerCrashed {
            name: "s".into(),
            reason: "gone".into(),
        }
        .is_transport_fault());
        assert!(!McpError::Timeout {
            server: "s".into(),
            tool: "t".into(),
            timeout_ms: 1,
        }
        .is_transport_fault());
    }
}
