//! JSON-RPC transports.
//!
//! Every transport multiplexes requests through a [`PendingRequests`] table
//! keyed by JSON-RPC id, so several tool calls may be in flight on one
//! connection and a timed-out call never poisons the next one.
//!
//! The stdio transport speaks line-delimited JSON (one object per line) over
//! a child process's stdin/stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, Incoming, IncomingMessage, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Sender half used by a transport to report that its connection is gone.
pub type FaultSender = mpsc::UnboundedSender<String>;

/// A live JSON-RPC channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), McpError>;

    /// Release network-side state. Process teardown is handled elsewhere.
    async fn close(&self) {}
}

// ─── Pending Requests ────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

/// In-flight requests awaiting a response, keyed by id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    state: StdMutex<PendingState>,
}

impl PendingRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter. Fails if the connection is already closed.
    pub(crate) fn register(&self, id: u64) -> Option<PendingGuard<'_>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.waiters.insert(id, tx);
        Some(PendingGuard {
            pending: self,
            id,
            rx: Some(rx),
        })
    }

    /// Hand a response to its waiter. Returns false for unknown ids.
    pub(crate) fn complete(&self, response: JsonRpcResponse) -> bool {
        let waiter = self.lock().waiters.remove(&response.id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter and refuse new ones.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    fn cancel(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes its waiter on drop, so abandoned (timed-out) calls don't leak.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u64,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
}

impl PendingGuard<'_> {
    /// Wait for the response. `None` means the connection closed first.
    pub(crate) async fn wait(mut self) -> Option<JsonRpcResponse> {
        let rx = self.rx.take()?;
        rx.await.ok()
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}

/// Aborts a background reader task when the owning transport goes away.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Serialize a request line (newline-terminated).
pub(crate) fn encode_line(server: &str, value: &impl serde::Serialize) -> Result<String, McpError> {
    let mut json = serde_json::to_string(value).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

/// The reply we send to a server-initiated request.
///
/// `ping` gets an empty result; anything else (sampling, roots, elicitation)
/// is not supported by this client.
pub(crate) fn reply_to_server_request(id: serde_json::Value, method: &str) -> serde_json::Value {
    if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("client does not support '{method}'"),
            },
        })
    }
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// Lines go to stdin through a single writer task, so a caller that is
/// cancelled mid-request never leaves a partial line on the pipe.
pub struct StdioTransport {
    server_name: String,
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<PendingRequests>,
    _reader: AbortOnDrop,
    _writer: AbortOnDrop,
}

impl StdioTransport {
    /// Create a new transport over a process's stdin (`writer`) and stdout
    /// (`reader`).
    ///
    /// A reader task dispatches responses to their waiters. When stdout hits
    /// EOF or errors, all waiters fail and `faults` receives the reason.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R, faults: FaultSender) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outgoing, lines) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingRequests::default());

        let writer = tokio::spawn(write_loop(server_name.to_string(), writer, lines));
        let reader = tokio::spawn(read_loop(
            server_name.to_string(),
            BufReader::new(reader),
            outgoing.clone(),
            Arc::clone(&pending),
            faults,
        ));

        Self {
            server_name: server_name.to_string(),
            outgoing,
            pending,
            _reader: AbortOnDrop(reader),
            _writer: AbortOnDrop(writer),
        }
    }

    fn send_line(&self, line: String) -> Result<(), McpError> {
        self.outgoing
            .send(line)
            .map_err(|_| McpError::TransportError {
                server: self.server_name.clone(),
                reason: "server stdin closed (process may have exited)".into(),
            })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let line = encode_line(&self.server_name, &JsonRpcRequest::new(id, method, params))?;

        let waiter = self.pending.register(id).ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        })?;

        self.send_line(line)?;

        waiter.wait().await.ok_or_else(|| McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        })
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let line = encode_line(&self.server_name, &notification)?;
        self.send_line(line)
    }
}

/// Write queued lines to stdin, one whole line at a time.
async fn write_loop<W: AsyncWrite + Unpin>(
    server: String,
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            // The reader sees EOF on the same failure and reports the fault.
            tracing::debug!(server = %server, error = %e, "failed to write to server stdin");
            break;
        }
    }
}

/// Read stdout line by line until EOF, routing each message.
async fn read_loop<R: AsyncRead + Unpin>(
    server: String,
    mut reader: BufReader<R>,
    outgoing: mpsc::UnboundedSender<String>,
    pending: Arc<PendingRequests>,
    faults: FaultSender,
) {
    let mut line_buf = String::new();

    let reason = loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => {}
            Err(e) => break format!("failed to read from stdout: {e}"),
        }

        let trimmed = line_buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Non-JSON lines are server log output written to the wrong stream.
        let Ok(message) = serde_json::from_str::<IncomingMessage>(trimmed) else {
            tracing::debug!(server = %server, line = trimmed, "skipping non-JSON stdout line");
            continue;
        };

        match message.classify() {
            Some(Incoming::Response(resp)) => {
                let id = resp.id;
                if !pending.complete(resp) {
                    tracing::debug!(server = %server, id, "response for abandoned request");
                }
            }
            Some(Incoming::Request { id, method }) => {
                let reply = reply_to_server_request(id, &method);
                let sent = encode_line(&server, &reply)
                    .ok()
                    .is_some_and(|line| outgoing.send(line).is_ok());
                if !sent {
                    tracing::debug!(server = %server, method = %method, "failed to answer server request");
                }
            }
            Some(Incoming::Notification { method }) => {
                tracing::trace!(server = %server, method = %method, "server notification");
            }
            None => {}
        }
    };

    pending.close();
    let _ = faults.send(reason);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
