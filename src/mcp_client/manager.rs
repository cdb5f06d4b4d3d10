//! MCP Manager — owns every configured server client.
//!
//! Starts servers in parallel, exposes bridged tools and resource context
//! from ready servers only, and shuts everything down together. The
//! name → client map is written only by `start()` and `shutdown()`; readers
//! take a shared lock and see a consistent snapshot.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;

use super::client::ServerClient;
use super::config::{McpServersConfig, ServerSpec, TransportKind};
use super::errors::McpError;
use super::process::ProcessClient;
use super::stream::StreamClient;
use super::types::ClientState;
use crate::bridge::{bridge_tools, compose_resource_context, server_resource_block, BridgedTool, ToolOutput};
use crate::credentials::CredentialResolver;

/// Builds the client for one spec.
pub type ClientFactory =
    Arc<dyn Fn(&ServerSpec) -> Result<Arc<dyn ServerClient>, McpError> + Send + Sync>;

/// Diagnostic snapshot of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub state: ClientState,
    pub tool_count: usize,
    pub restart_attempts: u32,
    pub error: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    clients: BTreeMap<String, Arc<dyn ServerClient>>,
    /// Servers whose client could not be constructed.
    failed: BTreeMap<String, String>,
}

/// Orchestrates a fixed set of MCP servers.
pub struct McpManager {
    specs: Vec<ServerSpec>,
    factory: ClientFactory,
    state: RwLock<ManagerState>,
}

/// The default factory: `ProcessClient` for stdio, `StreamClient` otherwise.
pub fn default_factory(credentials: Arc<CredentialResolver>) -> ClientFactory {
    Arc::new(move |spec: &ServerSpec| -> Result<Arc<dyn ServerClient>, McpError> {
        match spec.transport {
            TransportKind::Stdio => Ok(Arc::new(ProcessClient::from_spec(
                spec.clone(),
                Arc::clone(&credentials),
            )?)),
            TransportKind::Sse | TransportKind::Http => Ok(Arc::new(StreamClient::from_spec(
                spec.clone(),
                Arc::clone(&credentials),
            )?)),
        }
    })
}

impl McpManager {
    /// A manager using the default credential providers.
    pub fn new(specs: Vec<ServerSpec>) -> Self {
        Self::with_credentials(specs, Arc::new(CredentialResolver::with_defaults()))
    }

    pub fn with_credentials(specs: Vec<ServerSpec>, credentials: Arc<CredentialResolver>) -> Self {
        Self::with_factory(specs, default_factory(credentials))
    }

    /// A manager whose clients come from `factory` (substitutes in tests).
    pub fn with_factory(specs: Vec<ServerSpec>, factory: ClientFactory) -> Self {
        Self {
            specs,
            factory,
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// Load a JSON or YAML servers file.
    pub fn from_config_file(path: &Path) -> Result<Self, McpError> {
        Ok(Self::new(McpServersConfig::load(path)?.into_specs()))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Construct and connect every enabled server concurrently.
    ///
    /// One server failing never stops the others. Returns the servers that
    /// failed (construction or first connection); failed connections stay
    /// under their client's restart policy.
    pub async fn start(&self) -> Vec<(String, McpError)> {
        let mut failures = Vec::new();
        let mut launched: Vec<Arc<dyn ServerClient>> = Vec::new();

        {
            let mut state = self.state.write().await;
            for spec in self.specs.iter().filter(|s| s.enabled) {
                if state.clients.contains_key(&spec.name) {
                    continue;
                }
                match (self.factory)(spec) {
                    Ok(client) => {
                        state.failed.remove(&spec.name);
                        state.clients.insert(spec.name.clone(), Arc::clone(&client));
                        launched.push(client);
                    }
                    Err(e) => {
                        tracing::error!(server = %spec.name, error = %e, "invalid MCP server configuration");
                        state.failed.insert(spec.name.clone(), e.to_string());
                        failures.push((spec.name.clone(), e));
                    }
                }
            }
        }

        let results = join_all(launched.iter().map(|client| async move {
            (client.name().to_string(), client.connect().await)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                tracing::warn!(server = %name, error = %e, "MCP server failed to start");
                failures.push((name, e));
            }
        }

        let configured = self.specs.iter().filter(|s| s.enabled).count();
        let ready = self.ready_clients().await.len();
        tracing::info!(ready, configured, "MCP servers started");

        failures
    }

    /// Disconnect every client concurrently, then forget them.
    pub async fn shutdown(&self) {
        let clients = {
            let mut state = self.state.write().await;
            state.failed.clear();
            std::mem::take(&mut state.clients)
        };
        if clients.is_empty() {
            return;
        }

        let handles: Vec<(String, tokio::task::JoinHandle<()>)> = clients
            .into_iter()
            .map(|(name, client)| {
                (
                    name,
                    tokio::spawn(async move { client.disconnect().await }),
                )
            })
            .collect();

        let count = handles.len();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(server = %name, error = %e, "MCP server disconnect panicked");
            }
        }
        tracing::info!(servers = count, "MCP servers shut down");
    }

    // ─── Capabilities ────────────────────────────────────────────────────

    async fn ready_clients(&self) -> Vec<Arc<dyn ServerClient>> {
        self.state
            .read()
            .await
            .clients
            .values()
            .filter(|c| c.state() == ClientState::Ready)
            .cloned()
            .collect()
    }

    /// Bridged tools of every ready server.
    pub async fn get_tools(&self) -> Vec<BridgedTool> {
        self.ready_clients()
            .await
            .iter()
            .flat_map(bridge_tools)
            .collect()
    }

    /// Resource context across ready servers; empty when there is none.
    pub async fn get_resource_context(&self) -> String {
        let clients = self.ready_clients().await;
        let blocks: Vec<String> = join_all(clients.iter().map(server_resource_block))
            .await
            .into_iter()
            .flatten()
            .collect();
        compose_resource_context(&blocks)
    }

    /// Invoke a bridged tool by its external name.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, McpError> {
        let tool = self
            .get_tools()
            .await
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| McpError::UnknownTool {
                name: tool_name.to_string(),
            })?;
        Ok(tool.invoke(arguments).await)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// State and tool count per configured server.
    pub async fn get_status(&self) -> BTreeMap<String, ServerStatus> {
        let state = self.state.read().await;
        let mut status = BTreeMap::new();

        for spec in &self.specs {
            let entry = match state.clients.get(&spec.name) {
                Some(client) => ServerStatus {
                    state: client.state(),
                    tool_count: client.tools().len(),
                    restart_attempts: client.restart_attempts(),
                    error: client.last_error(),
                },
                None => ServerStatus {
                    state: if state.failed.contains_key(&spec.name) {
                        ClientState::Error
                    } else {
                        ClientState::Disconnected
                    },
                    tool_count: 0,
                    restart_attempts: 0,
                    error: state.failed.get(&spec.name).cloned(),
                },
            };
            status.insert(spec.name.clone(), entry);
        }
        status
    }

    /// Names of all configured servers (including disabled and failed), sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.iter().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
