//! Per-server configuration.
//!
//! A `ServerSpec` is handed to the client already validated by the host's
//! config layer; `validate()` re-checks the transport invariants so a bad
//! spec can never reach a connection attempt.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

/// Default time allowed for spawn/connect + handshake + discovery.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default per-call timeout for `tools/call`.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 60_000;

/// Default cap on consecutive restart attempts.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Transport used to reach a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking line-delimited JSON-RPC on stdin/stdout.
    #[default]
    Stdio,
    /// Persistent `text/event-stream` plus POST endpoint.
    Sse,
    /// Streamable HTTP: one POST per request, JSON or SSE reply.
    Http,
}

/// Immutable configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Identity; filled from the config map key when loaded from a file.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: TransportKind,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may be `secret://` references.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    // sse / http
    #[serde(default)]
    pub url: Option<String>,
    /// Values may be `secret://` references.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Overrides the server name in `mcp_{prefix}_{tool}`.
    #[serde(default)]
    pub tool_prefix: Option<String>,
    /// Resource discovery on/off.
    #[serde(default = "default_true")]
    pub resources: bool,
    /// URI substrings; empty means every resource.
    #[serde(default)]
    pub resource_filter: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_tool_timeout_ms() -> u64 {
    DEFAULT_TOOL_TIMEOUT_MS
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

impl ServerSpec {
    fn base(name: &str, transport: TransportKind) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            restart_on_crash: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            tool_prefix: None,
            resources: true,
            resource_filter: Vec::new(),
        }
    }

    /// A stdio server with defaults for everything but the command.
    pub fn stdio(name: &str, command: &str) -> Self {
        let mut spec = Self::base(name, TransportKind::Stdio);
        spec.command = Some(command.to_string());
        spec
    }

    /// An SSE or streamable-HTTP server with defaults for everything but the URL.
    pub fn network(name: &str, transport: TransportKind, url: &str) -> Self {
        let mut spec = Self::base(name, transport);
        spec.url = Some(url.to_string());
        spec
    }

    /// Check the transport-specific required fields.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.name.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: "server name must not be empty".into(),
            });
        }

        match self.transport {
            TransportKind::Stdio => {
                let has_command = self
                    .command
                    .as_deref()
                    .is_some_and(|c| !c.trim().is_empty());
                if !has_command {
                    return Err(McpError::ConfigError {
                        reason: format!(
                            "server '{}': 'command' is required for stdio transport",
                            self.name
                        ),
                    });
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                let has_url = self.url.as_deref().is_some_and(|u| !u.trim().is_empty());
                if !has_url {
                    return Err(McpError::ConfigError {
                        reason: format!(
                            "server '{}': 'url' is required for {} transport",
                            self.name,
                            self.transport_label()
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn transport_label(&self) -> &'static str {
        match self.transport {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        }
    }

    /// Prefix used in bridged tool names.
    pub fn tool_prefix(&self) -> &str {
        self.tool_prefix.as_deref().unwrap_or(&self.name)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Whether a resource URI passes `resource_filter`.
    pub fn accepts_resource(&self, uri: &str) -> bool {
        self.resource_filter.is_empty()
            || self
                .resource_filter
                .iter()
                .any(|needle| uri.contains(needle.as_str()))
    }
}

// ─── Config File ─────────────────────────────────────────────────────────────

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerSpec>,
}

impl McpServersConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, McpError> {
        serde_json::from_str(raw).map_err(|e| McpError::ConfigError {
            reason: format!("invalid JSON server config: {e}"),
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, McpError> {
        serde_yaml::from_str(raw).map_err(|e| McpError::ConfigError {
            reason: format!("invalid YAML server config: {e}"),
        })
    }

    /// Load from a `.json`, `.yaml`, or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }

    /// Enabled specs, each stamped with its map key as its name.
    pub fn into_specs(self) -> Vec<ServerSpec> {
        self.servers
            .into_iter()
            .filter_map(|(name, mut spec)| {
                if !spec.enabled {
                    tracing::debug!(server = %name, "MCP server disabled in config, skipping");
                    return None;
                }
                spec.name = name;
                Some(spec)
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
