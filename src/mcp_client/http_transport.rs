//! Network transports: legacy SSE and streamable HTTP.
//!
//! - **SSE**: `GET` a long-lived `text/event-stream`; the first `endpoint`
//!   event names the URL that requests are `POST`ed to; responses arrive as
//!   `message` events on the stream.
//! - **Streamable HTTP**: every request is a `POST`; the reply is either
//!   `application/json` or a short `text/event-stream`. The server may assign
//!   an `Mcp-Session-Id`, which is echoed on later requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;

use super::errors::McpError;
use super::transport::{
    next_request_id, reply_to_server_request, AbortOnDrop, FaultSender, PendingRequests, Transport,
};
use super::types::{Incoming, IncomingMessage, JsonRpcRequest, JsonRpcResponse};

const SESSION_HEADER: &str = "mcp-session-id";

// ─── SSE Decoding ────────────────────────────────────────────────────────────

/// A parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Events without an explicit type default to `message`.
    pub fn is_message(&self) -> bool {
        self.event.as_deref().map_or(true, |e| e == "message")
    }
}

/// Parse one SSE event block (the text between blank lines).
pub fn parse_sse_event(raw: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            // `retry` and unknown fields are ignored.
            _ => {}
        }
    }

    (has_data || event.event.is_some()).then_some(event)
}

/// Largest pending event the decoder holds before giving up on a stream.
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// A stream sent more than the decoder's limit without ending an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SSE event exceeds {limit} bytes without a terminating blank line")]
pub struct SseOverflow {
    pub limit: usize,
}

/// Incremental SSE decoder over arbitrary byte chunks.
///
/// Works on bytes so multi-byte characters split across chunks survive.
/// Each push only scans bytes it has not looked at before.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no event terminator.
    scanned: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, SseOverflow> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        let mut consumed = 0;
        // Step back one byte: a terminator may straddle two chunks.
        let mut cursor = self.scanned.saturating_sub(1);
        while let Some(pos) = self.buffer[cursor..].windows(2).position(|w| w == b"\n\n") {
            let end = cursor + pos + 2;
            let block = String::from_utf8_lossy(&self.buffer[consumed..end]);
            if let Some(event) = parse_sse_event(&block) {
                events.push(event);
            }
            consumed = end;
            cursor = end;
        }
        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.limit {
            self.buffer.clear();
            self.scanned = 0;
            return Err(SseOverflow { limit: self.limit });
        }
        Ok(events)
    }

    /// Flush whatever is left when the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            None
        } else {
            parse_sse_event(&text)
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Convert resolved header pairs into a `HeaderMap`.
///
/// Errors name the header, never its (possibly secret) value.
pub fn build_header_map(
    server: &str,
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| McpError::ConfigError {
            reason: format!("server '{server}': invalid header name '{key}'"),
        })?;
        let mut value = HeaderValue::from_str(value).map_err(|_| McpError::ConfigError {
            reason: format!("server '{server}': invalid value for header '{key}'"),
        })?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

fn transport_error(server: &str, reason: String) -> McpError {
    McpError::TransportError {
        server: server.to_string(),
        reason,
    }
}

/// POST a reply to a server-initiated request. Best effort.
async fn post_reply(http: HttpClient, url: Url, headers: HeaderMap, reply: serde_json::Value) {
    let result = http
        .post(url)
        .headers(headers)
        .header(CONTENT_TYPE, "application/json")
        .json(&reply)
        .send()
        .await;
    if let Err(e) = result {
        tracing::debug!(error = %e, "failed to answer server request");
    }
}

// ─── Legacy SSE Transport ────────────────────────────────────────────────────

/// Persistent event-stream transport.
pub struct SseTransport {
    server_name: String,
    http: HttpClient,
    endpoint: Url,
    headers: HeaderMap,
    pending: Arc<PendingRequests>,
    _reader: AbortOnDrop,
}

impl SseTransport {
    /// Open the event stream and wait for the server's `endpoint` event.
    pub async fn open(
        server_name: &str,
        http: HttpClient,
        url: &str,
        headers: HeaderMap,
        faults: FaultSender,
    ) -> Result<Self, McpError> {
        let connect_failed = |reason: String| McpError::ConnectFailed {
            name: server_name.to_string(),
            reason,
        };

        let base = Url::parse(url).map_err(|e| connect_failed(format!("invalid url: {e}")))?;

        let response = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_failed(format!("event stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(connect_failed(format!("event stream returned HTTP {status}")));
        }

        let pending = Arc::new(PendingRequests::default());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = AbortOnDrop(tokio::spawn(sse_read_loop(
            SseReader {
                server: server_name.to_string(),
                base,
                endpoint_tx: Some(endpoint_tx),
                endpoint: None,
                pending: Arc::clone(&pending),
                http: http.clone(),
                headers: headers.clone(),
                faults,
            },
            response,
        )));

        let endpoint = match endpoint_rx.await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(reason)) => return Err(connect_failed(reason)),
            Err(_) => {
                return Err(connect_failed(
                    "event stream closed before the endpoint event".into(),
                ))
            }
        };

        tracing::debug!(server = server_name, endpoint = %endpoint, "SSE endpoint received");

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            endpoint,
            headers,
            pending,
            _reader: reader,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport_error(
                &self.server_name,
                format!("POST returned HTTP {status}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| transport_error(&self.server_name, format!("failed to serialize: {e}")))?;

        let waiter = self
            .pending
            .register(id)
            .ok_or_else(|| transport_error(&self.server_name, "event stream closed".into()))?;

        self.post(&body).await?;

        waiter
            .wait()
            .await
            .ok_or_else(|| transport_error(&self.server_name, "event stream closed".into()))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }
}

struct SseReader {
    server: String,
    base: Url,
    endpoint_tx: Option<oneshot::Sender<Result<Url, String>>>,
    endpoint: Option<Url>,
    pending: Arc<PendingRequests>,
    http: HttpClient,
    headers: HeaderMap,
    faults: FaultSender,
}

impl SseReader {
    fn handle_event(&mut self, event: SseEvent) {
        if event.event.as_deref() == Some("endpoint") {
            match self.base.join(event.data.trim()) {
                // Requests carry credential headers; they only go back to
                // the origin the stream was opened on.
                Ok(url) if url.origin() != self.base.origin() => {
                    let reason = format!(
                        "endpoint origin {} differs from server origin {}",
                        url.origin().ascii_serialization(),
                        self.base.origin().ascii_serialization()
                    );
                    tracing::warn!(server = %self.server, "rejected SSE endpoint event: {reason}");
                    if let Some(tx) = self.endpoint_tx.take() {
                        let _ = tx.send(Err(reason));
                    }
                }
                Ok(url) => {
                    self.endpoint = Some(url.clone());
                    if let Some(tx) = self.endpoint_tx.take() {
                        let _ = tx.send(Ok(url));
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %self.server, error = %e, "invalid SSE endpoint event");
                }
            }
            return;
        }

        if !event.is_message() || event.data.is_empty() {
            return;
        }

        let Ok(message) = serde_json::from_str::<IncomingMessage>(&event.data) else {
            tracing::warn!(server = %self.server, "failed to parse SSE event data as JSON-RPC message");
            return;
        };

        match message.classify() {
            Some(Incoming::Response(resp)) => {
                self.pending.complete(resp);
            }
            Some(Incoming::Request { id, method }) => {
                if let Some(endpoint) = self.endpoint.clone() {
                    let reply = reply_to_server_request(id, &method);
                    tokio::spawn(post_reply(
                        self.http.clone(),
                        endpoint,
                        self.headers.clone(),
                        reply,
                    ));
                }
            }
            Some(Incoming::Notification { .. }) | None => {}
        }
    }
}

async fn sse_read_loop(mut reader: SseReader, response: reqwest::Response) {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    let reason = loop {
        match stream.next().await {
            Some(Ok(bytes)) => match decoder.push(&bytes) {
                Ok(events) => {
                    for event in events {
                        reader.handle_event(event);
                    }
                }
                Err(overflow) => break overflow.to_string(),
            },
            Some(Err(e)) => break format!("event stream read error: {e}"),
            None => {
                if let Some(event) = decoder.finish() {
                    reader.handle_event(event);
                }
                break "event stream closed by server".to_string();
            }
        }
    };

    reader.pending.close();
    let _ = reader.faults.send(reason);
}

// ─── Streamable HTTP Transport ───────────────────────────────────────────────

/// Request-per-POST transport.
pub struct StreamableHttpTransport {
    server_name: String,
    http: HttpClient,
    url: Url,
    headers: HeaderMap,
    session_id: StdMutex<Option<String>>,
    faults: FaultSender,
}

impl StreamableHttpTransport {
    pub fn new(
        server_name: &str,
        http: HttpClient,
        url: &str,
        headers: HeaderMap,
        faults: FaultSender,
    ) -> Result<Self, McpError> {
        let url = Url::parse(url).map_err(|e| McpError::ConnectFailed {
            name: server_name.to_string(),
            reason: format!("invalid url: {e}"),
        })?;

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            url,
            headers,
            session_id: StdMutex::new(None),
            faults,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(session) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&session) {
                headers.insert(HeaderName::from_static(SESSION_HEADER), value);
            }
        }
        headers
    }

    fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut slot = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_deref() != Some(value) {
                tracing::debug!(server = %self.server_name, "captured MCP session ID");
                *slot = Some(value.to_string());
            }
        }
    }

    /// Report a connection-level failure to the supervising client.
    fn fault(&self, reason: String) -> McpError {
        let _ = self.faults.send(reason.clone());
        transport_error(&self.server_name, reason)
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let response = self
            .http
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.fault(format!("failed to connect to MCP server: {e}"))
                } else {
                    transport_error(&self.server_name, format!("HTTP request failed: {e}"))
                }
            })?;

        self.capture_session_id(response.headers());

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(self.fault("MCP session expired (HTTP 404)".into()));
        }
        if !status.is_success() {
            return Err(transport_error(
                &self.server_name,
                format!("HTTP {status} from MCP server"),
            ));
        }
        Ok(response)
    }

    /// Read an SSE reply body until the response with `id` shows up.
    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        loop {
            let events = match stream.next().await {
                Some(Ok(bytes)) => decoder
                    .push(&bytes)
                    .map_err(|e| transport_error(&self.server_name, e.to_string()))?,
                Some(Err(e)) => {
                    return Err(transport_error(
                        &self.server_name,
                        format!("response stream read error: {e}"),
                    ))
                }
                None => match decoder.finish() {
                    Some(event) => vec![event],
                    None => {
                        return Err(transport_error(
                            &self.server_name,
                            "response stream ended without a reply".into(),
                        ))
                    }
                },
            };

            for event in events {
                if !event.is_message() || event.data.is_empty() {
                    continue;
                }
                let Ok(message) = serde_json::from_str::<IncomingMessage>(&event.data) else {
                    continue;
                };
                match message.classify() {
                    Some(Incoming::Response(resp)) if resp.id == id => return Ok(resp),
                    Some(Incoming::Request { id: req_id, method }) => {
                        let reply = reply_to_server_request(req_id, &method);
                        tokio::spawn(post_reply(
                            self.http.clone(),
                            self.url.clone(),
                            self.request_headers(),
                            reply,
                        ));
                    }
                    _ => {}
                }
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| transport_error(&self.server_name, format!("failed to serialize: {e}")))?;

        let response = self.post(&body).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            return self.read_event_stream(response, id).await;
        }

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&self.server_name, format!("failed to read body: {e}")))?;

        let message: IncomingMessage = serde_json::from_str(&text).map_err(|e| {
            transport_error(&self.server_name, format!("malformed JSON-RPC reply: {e}"))
        })?;

        match message.classify() {
            Some(Incoming::Response(resp)) => Ok(resp),
            _ => Err(transport_error(
                &self.server_name,
                "reply was not a JSON-RPC response".into(),
            )),
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
        .map(|_| ())
    }

    /// End the server-side session, if one was assigned.
    async fn close(&self) {
        let Some(session) = self.session_id() else {
            return;
        };
        let result = self
            .http
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server_name, error = %e, "failed to end MCP session");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_fields() {
        let event = parse_sse_event("id: 7\nevent: message\ndata: {\"a\":1}\n").unwrap();
        assert_eq!(event.id.as_deref(), Some("7"));
        assert!(event.is_message());
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[test]
    fn test_multiline_data_joined() {
        let event = parse_sse_event("data: line1\ndata: line2").unwrap();
        assert_eq!(event.data, "line1\nline2");
    }

    #[test]
    fn test_comment_only_block_is_not_an_event() {
        assert!(parse_sse_event(": keep-alive").is_none());
    }

    #[test]
    fn test_endpoint_event_is_not_a_message() {
        let event = parse_sse_event("event: endpoint\ndata: /messages?sessionId=1").unwrap();
        assert!(!event.is_message());
        assert_eq!(event.data, "/messages?sessionId=1");
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: endpoint\r\nda").unwrap().is_empty());
        let events = decoder.push(b"ta: /rpc\r\n\r\ndata: {}\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "/rpc");

        let tail = decoder.finish().unwrap();
        assert_eq!(tail.data, "{}");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_keeps_multibyte_chars_across_chunks() {
        let mut decoder = SseDecoder::new();
        let payload = "data: héllo\n\n".as_bytes();
        let (a, b) = payload.split_at(8); // splits inside 'é'
        assert!(decoder.push(a).unwrap().is_empty());
        let events = decoder.push(b).unwrap();
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_decoder_terminator_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: a\n").unwrap().is_empty());
        let events = decoder.push(b"\ndata: b\n\ndata: c").unwrap();
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b"]);
        assert_eq!(decoder.finish().unwrap().data, "c");
    }

    #[test]
    fn test_decoder_rejects_unterminated_event_over_limit() {
        let mut decoder = SseDecoder::with_limit(64);
        for _ in 0..3 {
            assert!(decoder.push(&[b'x'; 20]).unwrap().is_empty());
        }
        let err = decoder.push(&[b'x'; 20]).unwrap_err();
        assert_eq!(err, SseOverflow { limit: 64 });
        assert!(err.to_string().contains("64 bytes"));

        // Events that end in time are fine, whatever the total volume.
        let mut decoder = SseDecoder::with_limit(64);
        for i in 0..100 {
            let events = decoder.push(format!("data: {i}\n\n").as_bytes()).unwrap();
            assert_eq!(events[0].data, i.to_string());
        }
    }

    #[test]
    fn test_header_map_errors_hide_values() {
        let headers = HashMap::from([("Authorization".to_string(), "Bearer bad\nvalue".to_string())]);
        let err = build_header_map("remote", &headers).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Authorization"));
        assert!(!msg.contains("Bearer"));
    }

    #[test]
    fn test_header_map_marks_values_sensitive() {
        let headers = HashMap::from([("X-Api-Key".to_string(), "abc".to_string())]);
        let map = build_header_map("remote", &headers).unwrap();
        assert!(map.get("x-api-key").unwrap().is_sensitive());
    }
}
