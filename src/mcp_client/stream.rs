//! Network connections: legacy SSE and streamable HTTP.
//!
//! Header values are resolved through the credential resolver on every
//! attempt, then the sub-mode picks the transport. Restart supervision is
//! shared with stdio servers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio::sync::mpsc;

use super::client::{Connection, Connector, SupervisedClient, Teardown};
use super::config::{ServerSpec, TransportKind};
use super::errors::McpError;
use super::http_transport::{build_header_map, SseTransport, StreamableHttpTransport};
use super::transport::Transport;
use crate::credentials::CredentialResolver;

/// TCP connect timeout for the HTTP client; the overall connect budget is
/// enforced by the client.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A client for a remote SSE / streamable HTTP server.
pub type StreamClient = SupervisedClient<StreamConnector>;

impl StreamClient {
    pub fn from_spec(
        spec: ServerSpec,
        credentials: Arc<CredentialResolver>,
    ) -> Result<Self, McpError> {
        SupervisedClient::new(spec, StreamConnector, credentials)
    }
}

/// Opens one network session per connection attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConnector;

#[async_trait]
impl Connector for StreamConnector {
    async fn establish(
        &self,
        spec: &ServerSpec,
        credentials: &CredentialResolver,
    ) -> Result<Connection, McpError> {
        let name = spec.name.as_str();
        let url = spec.url.as_deref().ok_or_else(|| McpError::ConfigError {
            reason: format!("network server '{name}' requires 'url'"),
        })?;

        let headers = credentials
            .resolve_map(&spec.headers)
            .await
            .map_err(|source| McpError::CredentialFailed {
                server: name.to_string(),
                source,
            })?;
        let headers = build_header_map(name, &headers)?;

        let http = HttpClient::builder()
            .connect_timeout(TCP_CONNECT_TIMEOUT.min(spec.connect_timeout()))
            .build()
            .map_err(|e| McpError::ConnectFailed {
                name: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let transport: Arc<dyn Transport> = match spec.transport {
            TransportKind::Sse => {
                Arc::new(SseTransport::open(name, http, url, headers, faults_tx).await?)
            }
            TransportKind::Http => {
                Arc::new(StreamableHttpTransport::new(name, http, url, headers, faults_tx)?)
            }
            TransportKind::Stdio => {
                return Err(McpError::ConfigError {
                    reason: format!("server '{name}' is not a network server"),
                })
            }
        };

        tracing::debug!(server = name, transport = spec.transport_label(), "network transport open");

        Ok(Connection {
            transport: Arc::clone(&transport),
            faults: faults_rx,
            teardown: Box::new(StreamTeardown { transport }),
        })
    }
}

/// Closes the session; the reader task stops when the last handle drops.
struct StreamTeardown {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl Teardown for StreamTeardown {
    async fn shutdown(self: Box<Self>) {
        self.transport.close().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
