//! In-memory MCP server, transport, and connector for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::client::{Connection, Connector, Teardown};
use super::config::ServerSpec;
use super::errors::McpError;
use super::transport::{next_request_id, FaultSender, Transport};
use super::types::{
    error_codes, CallToolResult, ContentItem, JsonRpcError, JsonRpcResponse, ResourceContents,
    ResourceDescriptor, ToolDescriptor, PROTOCOL_VERSION,
};
use crate::credentials::CredentialResolver;

// ─── Fake Server ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeServerState {
    tools: Vec<ToolDescriptor>,
    outputs: HashMap<String, CallToolResult>,
    resources: Vec<(ResourceDescriptor, ResourceContents)>,
    no_resource_methods: bool,
    unreadable: Vec<String>,
    page_size: Option<usize>,
    call_delay: Duration,
    calls: Vec<(String, Option<Value>)>,
    notifications: Vec<String>,
}

/// Scripted server behaviour, shared between every connection made to it.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeServerState> {
        self.state.lock().unwrap()
    }

    pub fn with_tool(self, name: &str, description: &str) -> Self {
        self.with_tool_schema(
            name,
            description,
            json!({"type": "object", "properties": {}}),
        )
    }

    pub fn with_tool_schema(self, name: &str, description: &str, schema: Value) -> Self {
        self.lock().tools.push(ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: schema,
        });
        self
    }

    /// Fixed result for a tool instead of the default echo.
    pub fn with_output(self, tool: &str, output: CallToolResult) -> Self {
        self.lock().outputs.insert(tool.to_string(), output);
        self
    }

    pub fn with_text_resource(self, uri: &str, text: &str) -> Self {
        self.push_resource(uri, Some("text/plain"), Some(text), None);
        self
    }

    pub fn with_blob_resource(self, uri: &str, mime_type: &str) -> Self {
        self.push_resource(uri, Some(mime_type), None, Some("AAEC"));
        self
    }

    fn push_resource(&self, uri: &str, mime: Option<&str>, text: Option<&str>, blob: Option<&str>) {
        let name = uri.rsplit('/').next().unwrap_or(uri).to_string();
        self.lock().resources.push((
            ResourceDescriptor {
                uri: uri.to_string(),
                name,
                description: None,
                mime_type: mime.map(str::to_string),
            },
            ResourceContents {
                uri: uri.to_string(),
                mime_type: mime.map(str::to_string),
                text: text.map(str::to_string),
                blob: blob.map(str::to_string),
            },
        ));
    }

    /// Listed like any text resource, but every read is an error.
    pub fn with_unreadable_resource(self, uri: &str) -> Self {
        self.push_resource(uri, Some("text/plain"), Some(""), None);
        self.lock().unreadable.push(uri.to_string());
        self
    }

    /// Answer `resources/*` with METHOD_NOT_FOUND and advertise no capability.
    pub fn without_resource_methods(self) -> Self {
        self.lock().no_resource_methods = true;
        self
    }

    pub fn with_page_size(self, size: usize) -> Self {
        self.lock().page_size = Some(size);
        self
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.lock().call_delay = delay;
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<(String, Option<Value>)> {
        self.lock().calls.clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.lock().notifications.clone()
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        self.lock().calls.push((method.to_string(), params.clone()));
        let params = params.unwrap_or(Value::Null);

        match method {
            "initialize" => {
                let state = self.lock();
                let mut capabilities = json!({"tools": {}});
                if !state.no_resource_methods {
                    capabilities["resources"] = json!({});
                }
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": {"name": "fake", "version": "0.0.0"},
                }))
            }
            "tools/list" => {
                let state = self.lock();
                let start: usize = params["cursor"]
                    .as_str()
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(state.tools.len());
                let size = state.page_size.unwrap_or(usize::MAX);
                let end = start.saturating_add(size).min(state.tools.len());
                let mut page = json!({"tools": &state.tools[start..end]});
                if end < state.tools.len() {
                    page["nextCursor"] = json!(end.to_string());
                }
                Ok(page)
            }
            "tools/call" => {
                let delay = self.lock().call_delay;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let state = self.lock();
                if let Some(output) = state.outputs.get(&name) {
                    return Ok(serde_json::to_value(output).unwrap());
                }
                if !state.tools.iter().any(|t| t.name == name) {
                    return Err(rpc_error(error_codes::INVALID_PARAMS, "unknown tool"));
                }
                let text = format!("{name} called with {}", params["arguments"]);
                Ok(serde_json::to_value(CallToolResult {
                    content: vec![ContentItem::Text { text }],
                    is_error: false,
                })
                .unwrap())
            }
            "resources/list" | "resources/read" if self.lock().no_resource_methods => {
                Err(rpc_error(error_codes::METHOD_NOT_FOUND, "method not found"))
            }
            "resources/list" => {
                let state = self.lock();
                let list: Vec<&ResourceDescriptor> = state.resources.iter().map(|(d, _)| d).collect();
                Ok(json!({"resources": list}))
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                let state = self.lock();
                if state.unreadable.iter().any(|u| u == uri) {
                    return Err(rpc_error(error_codes::INTERNAL_ERROR, "permission denied"));
                }
                match state.resources.iter().find(|(d, _)| d.uri == uri) {
                    Some((_, contents)) => Ok(json!({"contents": [contents]})),
                    None => Err(rpc_error(error_codes::INVALID_PARAMS, "resource not found")),
                }
            }
            _ => Err(rpc_error(error_codes::METHOD_NOT_FOUND, "method not found")),
        }
    }
}

fn rpc_error(code: i32, message: &str) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.to_string(),
        data: None,
    }
}

// ─── Fake Transport ──────────────────────────────────────────────────────────

/// Direct in-process calls into a [`FakeServer`].
pub struct FakeTransport {
    server: FakeServer,
    closed: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: "fake".into(),
                reason: "connection closed".into(),
            });
        }
        let id = next_request_id();
        let (result, error) = match self.server.handle(method, params).await {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Ok(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result,
            error,
        })
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
        self.server.lock().notifications.push(method.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ─── Fake Connector ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ConnectorState {
    fail_next: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    current: Mutex<Option<(FaultSender, Arc<AtomicBool>)>>,
    establish_delay: Mutex<Duration>,
    teardowns: AtomicUsize,
    queued_fault: Mutex<Option<String>>,
}

/// A [`Connector`] whose connections land on a [`FakeServer`].
///
/// Resolves `spec.env` and `spec.headers` through the credential resolver so
/// credential failures behave as they do for real transports.
#[derive(Clone)]
pub struct FakeConnector {
    server: FakeServer,
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            state: Arc::new(ConnectorState::default()),
        }
    }

    /// Queue a fault on every new connection before it is handed back.
    pub fn fault_on_establish(&self, reason: &str) {
        *self.state.queued_fault.lock().unwrap() = Some(reason.to_string());
    }

    /// Make the next `n` establish calls fail.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_establish_delay(&self, delay: Duration) {
        *self.state.establish_delay.lock().unwrap() = delay;
    }

    /// When each establish call started.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.attempts.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.lock().unwrap().len()
    }

    pub fn teardowns(&self) -> usize {
        self.state.teardowns.load(Ordering::SeqCst)
    }

    /// Drop the live connection as if the server died.
    pub fn crash(&self, reason: &str) {
        if let Some((faults, closed)) = self.state.current.lock().unwrap().take() {
            closed.store(true, Ordering::SeqCst);
            let _ = faults.send(reason.to_string());
        }
    }
}

struct FakeTeardown {
    closed: Arc<AtomicBool>,
    state: Arc<ConnectorState>,
}

#[async_trait]
impl Teardown for FakeTeardown {
    async fn shutdown(self: Box<Self>) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn establish(
        &self,
        spec: &ServerSpec,
        credentials: &CredentialResolver,
    ) -> Result<Connection, McpError> {
        self.state.attempts.lock().unwrap().push(Instant::now());

        let delay = *self.state.establish_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        for values in [&spec.env, &spec.headers] {
            credentials
                .resolve_map(values)
                .await
                .map_err(|source| McpError::CredentialFailed {
                    server: spec.name.clone(),
                    source,
                })?;
        }

        let failing = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(McpError::SpawnFailed {
                name: spec.name.clone(),
                reason: "scripted failure".into(),
            });
        }

        let transport = FakeTransport::new(self.server.clone());
        let closed = Arc::clone(&transport.closed);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        if let Some(reason) = self.state.queued_fault.lock().unwrap().clone() {
            let _ = faults_tx.send(reason);
        }
        *self.state.current.lock().unwrap() = Some((faults_tx, Arc::clone(&closed)));

        Ok(Connection {
            transport: Arc::new(transport),
            faults: faults_rx,
            teardown: Box::new(FakeTeardown {
                closed,
                state: Arc::clone(&self.state),
            }),
        })
    }
}
