//! ToolBridge: MCP tools as host tools.
//!
//! A discovered tool `read_file` on server `filesystem` becomes
//! `mcp_filesystem_read_file`. Invoking it never returns an error: every
//! failure is folded into a [`ToolOutput`] with `success: false`, and every
//! piece of server text is wrapped in the untrusted-content boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::schema::ToolParameters;
use super::untrusted::{warn_on_injection, wrap_untrusted};
use crate::mcp_client::client::ServerClient;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{CallToolResult, ContentItem, ToolDescriptor};

// ─── Host Types ──────────────────────────────────────────────────────────────

/// OpenAI-style tool definition handed to the host model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

/// Function definition within a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Non-text content from a server, passed through as-is and tagged with
/// where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalAttachment {
    /// `mcp:<server>`.
    pub source: String,
    pub content: ContentItem,
}

/// Result of invoking a bridged tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    /// External (bridged) tool name.
    pub tool_name: String,
    pub server: String,
    pub success: bool,
    /// Server text inside the untrusted-content boundary.
    pub text: String,
    pub attachments: Vec<ExternalAttachment>,
    /// Short failure summary produced locally (no server text).
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

// ─── BridgedTool ─────────────────────────────────────────────────────────────

/// `mcp_{prefix}_{tool}`.
pub fn bridged_tool_name(prefix: &str, tool: &str) -> String {
    format!("mcp_{prefix}_{tool}")
}

/// A remote tool bound to the client that serves it.
#[derive(Clone)]
pub struct BridgedTool {
    pub name: String,
    /// Server-prefixed description.
    pub description: String,
    pub parameters: ToolParameters,
    pub server: String,
    /// Name of the tool on the server.
    pub remote_name: String,
    pub timeout: Duration,
    client: Arc<dyn ServerClient>,
}

impl std::fmt::Debug for BridgedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedTool")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("remote_name", &self.remote_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BridgedTool {
    pub fn new(client: Arc<dyn ServerClient>, descriptor: &ToolDescriptor) -> Self {
        let spec = client.spec();
        let server = spec.name.clone();
        let description = if descriptor.description.trim().is_empty() {
            format!("[{server}] {}", descriptor.name)
        } else {
            format!("[{server}] {}", descriptor.description.trim())
        };

        Self {
            name: bridged_tool_name(spec.tool_prefix(), &descriptor.name),
            description,
            parameters: ToolParameters::from_input_schema(&descriptor.input_schema),
            remote_name: descriptor.name.clone(),
            timeout: spec.tool_timeout(),
            server,
            client,
        }
    }

    /// Call the remote tool. Never fails; see [`ToolOutput::success`].
    pub async fn invoke(&self, arguments: serde_json::Value) -> ToolOutput {
        let start = Instant::now();
        let result = self
            .client
            .call_tool(&self.remote_name, arguments, self.timeout)
            .await;
        let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut output = match result {
            Ok(result) => self.from_result(result),
            Err(e) => self.from_error(&e),
        };
        output.execution_time_ms = elapsed;

        if output.success {
            tracing::debug!(tool = %self.name, elapsed_ms = elapsed, "MCP tool call succeeded");
        } else {
            tracing::warn!(
                tool = %self.name,
                error = output.error.as_deref().unwrap_or(""),
                "MCP tool call failed"
            );
        }
        output
    }

    fn from_result(&self, result: CallToolResult) -> ToolOutput {
        let source = format!("mcp:{}", self.server);
        let mut texts = Vec::new();
        let mut attachments = Vec::new();

        for item in result.content {
            match item {
                ContentItem::Text { text } => texts.push(text),
                ContentItem::Resource { resource } if resource.text.is_some() => {
                    texts.extend(resource.text);
                }
                ContentItem::Unsupported => {
                    tracing::debug!(tool = %self.name, "skipping unsupported content item");
                }
                other => attachments.push(ExternalAttachment {
                    source: source.clone(),
                    content: other,
                }),
            }
        }

        let joined = texts.join("\n");
        warn_on_injection(&self.server, &self.name, &joined);

        let error = result.is_error.then(|| {
            format!(
                "tool '{}' on server '{}' reported an error",
                self.remote_name, self.server
            )
        });

        ToolOutput {
            tool_name: self.name.clone(),
            server: self.server.clone(),
            success: !result.is_error,
            text: wrap_untrusted(&self.server, &joined),
            attachments,
            error,
            execution_time_ms: 0,
        }
    }

    fn from_error(&self, error: &McpError) -> ToolOutput {
        // JSON-RPC error messages are server text; keep them inside the boundary.
        let summary = match error {
            McpError::ServerError { code, .. } => format!(
                "tool '{}' on server '{}' failed: server returned JSON-RPC error {code}",
                self.remote_name, self.server
            ),
            other => format!(
                "tool '{}' on server '{}' failed: {other}",
                self.remote_name, self.server
            ),
        };

        ToolOutput {
            tool_name: self.name.clone(),
            server: self.server.clone(),
            success: false,
            text: wrap_untrusted(&self.server, &error.to_string()),
            attachments: Vec::new(),
            error: Some(summary),
            execution_time_ms: 0,
        }
    }

    /// Host function definition for this tool.
    pub fn to_function_schema(&self) -> ToolDefinition {
        ToolDefinition {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.to_json_schema(),
            },
        }
    }
}

/// Bridge every tool of a client. Empty unless the client is ready.
pub fn bridge_tools(client: &Arc<dyn ServerClient>) -> Vec<BridgedTool> {
    client
        .tools()
        .iter()
        .map(|descriptor| BridgedTool::new(Arc::clone(client), descriptor))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
