//! Transport-independent MCP method calls.
//!
//! Everything here speaks to a `&dyn Transport`, so the stdio and network
//! clients share one handshake and discovery path.

use super::errors::McpError;
use super::transport::{extract_result, Transport};
use super::types::{
    error_codes, CallToolResult, InitializeResult, ListResourcesResult, ListToolsResult,
    ReadResourceResult, ResourceContents, ResourceDescriptor, ToolDescriptor, PROTOCOL_VERSION,
};

/// Upper bound on `nextCursor` pages followed in one listing.
const MAX_LIST_PAGES: usize = 100;

const CLIENT_NAME: &str = "mcp-bridge";

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the `initialize` request and send `notifications/initialized`.
pub async fn initialize(
    transport: &dyn Transport,
    server_name: &str,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    tracing::debug!(
        server = server_name,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        "handshake complete"
    );

    Ok(init)
}

// ─── Discovery ───────────────────────────────────────────────────────────────

fn cursor_params(cursor: Option<&str>) -> Option<serde_json::Value> {
    cursor.map(|c| serde_json::json!({ "cursor": c }))
}

/// Fetch every page of `tools/list`.
pub async fn list_tools(
    transport: &dyn Transport,
    server_name: &str,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let response = transport
            .request("tools/list", cursor_params(cursor.as_deref()))
            .await?;
        let page: ListToolsResult =
            serde_json::from_value(extract_result(response)?).map_err(|e| {
                McpError::InitFailed {
                    name: server_name.to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?;

        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(
        server = server_name,
        pages = MAX_LIST_PAGES,
        "tools/list pagination limit reached; list truncated"
    );
    Ok(tools)
}

/// Fetch every page of `resources/list`.
///
/// A server that doesn't implement the method has no resources.
pub async fn list_resources(
    transport: &dyn Transport,
    server_name: &str,
) -> Result<Vec<ResourceDescriptor>, McpError> {
    let mut resources = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let response = transport
            .request("resources/list", cursor_params(cursor.as_deref()))
            .await?;
        let result = match extract_result(response) {
            Ok(result) => result,
            Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                return Ok(resources);
            }
            Err(e) => return Err(e),
        };
        let page: ListResourcesResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("failed to parse resources/list response: {e}"),
            })?;

        resources.extend(page.resources);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(resources),
        }
    }

    tracing::warn!(
        server = server_name,
        pages = MAX_LIST_PAGES,
        "resources/list pagination limit reached; list truncated"
    );
    Ok(resources)
}

// ─── Invocation ──────────────────────────────────────────────────────────────

/// `tools/call`. JSON-RPC errors come back as `ServerError`; a tool-level
/// failure is a normal result with `is_error` set.
pub async fn call_tool(
    transport: &dyn Transport,
    server_name: &str,
    tool: &str,
    arguments: serde_json::Value,
) -> Result<CallToolResult, McpError> {
    let params = serde_json::json!({
        "name": tool,
        "arguments": arguments,
    });

    let response = transport.request("tools/call", Some(params)).await?;
    let result = extract_result(response)?;

    serde_json::from_value(result).map_err(|e| McpError::ToolFailed {
        server: server_name.to_string(),
        tool: tool.to_string(),
        reason: format!("malformed tools/call response: {e}"),
    })
}

/// `resources/read`.
pub async fn read_resource(
    transport: &dyn Transport,
    server_name: &str,
    uri: &str,
) -> Result<Vec<ResourceContents>, McpError> {
    let read_failed = |reason: String| McpError::ResourceReadFailed {
        server: server_name.to_string(),
        uri: uri.to_string(),
        reason,
    };

    let response = transport
        .request("resources/read", Some(serde_json::json!({ "uri": uri })))
        .await?;
    let result = extract_result(response).map_err(|e| read_failed(e.to_string()))?;

    let read: ReadResourceResult = serde_json::from_value(result)
        .map_err(|e| read_failed(format!("malformed resources/read response: {e}")))?;
    Ok(read.contents)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
