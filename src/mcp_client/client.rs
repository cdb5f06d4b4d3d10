//! Per-server client: connection state machine and restart supervision.
//!
//! ```text
//! disconnected --connect()--> connecting
//! connecting   --discovery ok--> ready
//! connecting   --handshake/discovery failure--> error
//! ready        --transport fault--> error
//! error        --restart timer (under cap)--> connecting
//! any          --disconnect()--> closed
//! ```
//!
//! Supervision is transport-agnostic. A [`Connector`] knows how to bring up
//! one connection (spawn a process, open a stream); [`SupervisedClient`]
//! drives the state machine, the handshake, and the restart policy on top of
//! it. `ProcessClient` and `StreamClient` are the two instantiations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::config::ServerSpec;
use super::errors::McpError;
use super::protocol;
use super::transport::Transport;
use super::types::{
    CallToolResult, ClientState, ResourceContents, ResourceDescriptor, ServerInfo, ToolDescriptor,
};
use crate::credentials::CredentialResolver;

// ─── Constants ───────────────────────────────────────────────────────────────

/// First restart delay; doubles per consecutive failure.
const RESTART_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for the restart delay.
const RESTART_MAX_DELAY_MS: u64 = 30_000;

/// Backoff before restart attempt `attempt` (0-based): 1s, 2s, 4s, … capped at 30s.
pub fn restart_delay(attempt: u32) -> Duration {
    let ms = 2u64
        .saturating_pow(attempt)
        .saturating_mul(RESTART_BASE_DELAY_MS)
        .min(RESTART_MAX_DELAY_MS);
    Duration::from_millis(ms)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Client Contract ─────────────────────────────────────────────────────────

/// What the manager and the bridges need from a server client.
///
/// Operations that need a live transport fail immediately with
/// [`McpError::NotReady`] outside the `ready` state.
#[async_trait]
pub trait ServerClient: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> &ServerSpec;

    fn state(&self) -> ClientState;

    /// Watch state transitions.
    fn subscribe(&self) -> watch::Receiver<ClientState>;

    /// Tools discovered by the current connection; empty unless ready.
    fn tools(&self) -> Vec<ToolDescriptor>;

    /// Consecutive failed connections since the last success.
    fn restart_attempts(&self) -> u32;

    /// Most recent connection failure, for diagnostics.
    fn last_error(&self) -> Option<String>;

    /// Connect, handshake, and discover. No-op when connecting or ready.
    async fn connect(&self) -> Result<(), McpError>;

    /// Cancel any pending restart, tear down the connection, and move to
    /// `closed`. Always succeeds.
    async fn disconnect(&self);

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError>;

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError>;

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError>;
}

// ─── Connector Seam ──────────────────────────────────────────────────────────

/// Releases whatever a connection holds (a child process, a session).
#[async_trait]
pub trait Teardown: Send {
    async fn shutdown(self: Box<Self>);
}

/// One freshly established transport.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    /// Receives a reason once when the connection dies underneath us.
    pub faults: mpsc::UnboundedReceiver<String>,
    pub teardown: Box<dyn Teardown>,
}

/// Brings up a transport for a server. Credentials are resolved here, once
/// per attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn establish(
        &self,
        spec: &ServerSpec,
        credentials: &CredentialResolver,
    ) -> Result<Connection, McpError>;
}

// ─── Supervised Client ───────────────────────────────────────────────────────

/// State of one successful handshake.
struct ActiveSession {
    transport: Arc<dyn Transport>,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    server_info: Option<ServerInfo>,
}

struct LiveConnection {
    session: Arc<ActiveSession>,
    teardown: Box<dyn Teardown>,
    /// Set once the connection is `ready`.
    monitor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RestartState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

struct ClientInner<C> {
    spec: ServerSpec,
    connector: C,
    credentials: Arc<CredentialResolver>,
    state_tx: watch::Sender<ClientState>,
    live: StdMutex<Option<LiveConnection>>,
    restart: StdMutex<RestartState>,
    last_error: StdMutex<Option<String>>,
    /// Serializes connection attempts.
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped per attempt so a stale monitor can't fault a newer connection.
    epoch: AtomicU64,
}

/// A [`ServerClient`] that supervises connections made by `C`.
pub struct SupervisedClient<C: Connector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for SupervisedClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for SupervisedClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedClient").finish_non_exhaustive()
    }
}

impl<C: Connector> SupervisedClient<C> {
    /// Validate `spec` and build a client in the `disconnected` state.
    pub fn new(
        spec: ServerSpec,
        connector: C,
        credentials: Arc<CredentialResolver>,
    ) -> Result<Self, McpError> {
        spec.validate()?;
        let (state_tx, _) = watch::channel(ClientState::Disconnected);

        Ok(Self {
            inner: Arc::new(ClientInner {
                spec,
                connector,
                credentials,
                state_tx,
                live: StdMutex::new(None),
                restart: StdMutex::new(RestartState::default()),
                last_error: StdMutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
        })
    }

    /// Server info reported by the current connection.
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.inner.live)
            .as_ref()
            .and_then(|live| live.session.server_info.clone())
    }
}

impl<C: Connector> ClientInner<C> {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    fn not_ready(&self, state: ClientState) -> McpError {
        McpError::NotReady {
            name: self.spec.name.clone(),
            state,
        }
    }

    /// Move `from` → `to` only if the state is still `from`.
    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn record_error(&self, error: &McpError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn ready_session(&self) -> Result<Arc<ActiveSession>, McpError> {
        let state = self.state();
        if state != ClientState::Ready {
            return Err(self.not_ready(state));
        }
        lock(&self.live)
            .as_ref()
            .map(|live| Arc::clone(&live.session))
            .ok_or_else(|| self.not_ready(state))
    }

    fn cancel_restart_timer(&self) {
        if let Some(timer) = lock(&self.restart).timer.take() {
            timer.abort();
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────

    async fn connect_attempt(self: &Arc<Self>) -> Result<(), McpError> {
        match self.state() {
            ClientState::Connecting | ClientState::Ready => return Ok(()),
            ClientState::Closed => return Err(self.not_ready(ClientState::Closed)),
            ClientState::Disconnected | ClientState::Error => {}
        }

        let _attempt = self.connect_lock.lock().await;

        // Re-check: another attempt may have finished while we waited.
        match self.state() {
            ClientState::Ready => return Ok(()),
            ClientState::Closed => return Err(self.not_ready(ClientState::Closed)),
            _ => {}
        }

        self.state_tx.send_replace(ClientState::Connecting);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            server = self.name(),
            transport = self.spec.transport_label(),
            "connecting to MCP server"
        );

        let timeout = self.spec.connect_timeout();
        let mut closed = self.state_tx.subscribe();
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.establish_session()) => match result {
                Ok(result) => result,
                Err(_) => Err(McpError::ConnectTimeout {
                    name: self.spec.name.clone(),
                    timeout_ms: duration_ms(timeout),
                }),
            },
            _ = wait_for_close(&mut closed) => {
                tracing::debug!(server = self.name(), "connection attempt cancelled by disconnect");
                return Err(self.not_ready(ClientState::Closed));
            }
        };

        match outcome {
            Ok((session, faults, teardown)) => self.install(epoch, session, faults, teardown).await,
            Err(e) => {
                if self.transition(ClientState::Connecting, ClientState::Error) {
                    tracing::warn!(server = self.name(), error = %e, "MCP server connection failed");
                    self.record_error(&e);
                    Self::schedule_restart(self);
                }
                Err(e)
            }
        }
    }

    /// Establish a transport, then handshake and discover over it.
    async fn establish_session(
        &self,
    ) -> Result<(ActiveSession, mpsc::UnboundedReceiver<String>, Box<dyn Teardown>), McpError> {
        let Connection {
            transport,
            faults,
            teardown,
        } = self.connector.establish(&self.spec, &self.credentials).await?;

        match self.discover(transport.as_ref()).await {
            Ok((tools, resources, server_info)) => Ok((
                ActiveSession {
                    transport,
                    tools,
                    resources,
                    server_info,
                },
                faults,
                teardown,
            )),
            Err(e) => {
                teardown.shutdown().await;
                Err(match e {
                    e @ McpError::InitFailed { .. } => e,
                    other => McpError::InitFailed {
                        name: self.spec.name.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn discover(
        &self,
        transport: &dyn Transport,
    ) -> Result<(Vec<ToolDescriptor>, Vec<ResourceDescriptor>, Option<ServerInfo>), McpError> {
        let name = self.name();
        let init = protocol::initialize(transport, name).await?;
        let tools = protocol::list_tools(transport, name).await?;

        let resources = if self.spec.resources && init.supports_resources() {
            protocol::list_resources(transport, name).await?
        } else {
            Vec::new()
        };

        Ok((tools, resources, init.server_info))
    }

    async fn install(
        self: &Arc<Self>,
        epoch: u64,
        session: ActiveSession,
        faults: mpsc::UnboundedReceiver<String>,
        teardown: Box<dyn Teardown>,
    ) -> Result<(), McpError> {
        let tool_count = session.tools.len();
        let resource_count = session.resources.len();

        let rejected = {
            let mut live = lock(&self.live);
            if self.state() == ClientState::Connecting {
                *live = Some(LiveConnection {
                    session: Arc::new(session),
                    teardown,
                    monitor: None,
                });
                None
            } else {
                Some(teardown)
            }
        };

        if let Some(teardown) = rejected {
            teardown.shutdown().await;
            return Err(self.not_ready(ClientState::Closed));
        }

        // Only disconnect() can move us off `connecting` here; it has taken
        // the live connection and torn it down.
        if !self.transition(ClientState::Connecting, ClientState::Ready) {
            return Err(self.not_ready(self.state()));
        }
        lock(&self.restart).attempts = 0;
        *lock(&self.last_error) = None;
        tracing::info!(
            server = self.name(),
            tools = tool_count,
            resources = resource_count,
            "MCP server ready"
        );

        // The monitor starts after `ready` so a fault that is already queued
        // still finds a state it can leave.
        let monitor = Self::spawn_monitor(self, epoch, faults);
        let mut live = lock(&self.live);
        match live.as_mut() {
            Some(live) if self.epoch.load(Ordering::SeqCst) == epoch => {
                live.monitor = Some(monitor);
            }
            // Disconnect or the monitor itself already took the connection;
            // the detached monitor finishes on its own.
            _ => drop(monitor),
        }
        Ok(())
    }

    // ─── Faults & Restart ────────────────────────────────────────────

    fn spawn_monitor(
        self: &Arc<Self>,
        epoch: u64,
        mut faults: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = faults
                .recv()
                .await
                .unwrap_or_else(|| "transport closed".to_string());
            if let Some(inner) = weak.upgrade() {
                inner.handle_fault(epoch, reason).await;
            }
        })
    }

    async fn handle_fault(self: &Arc<Self>, epoch: u64, reason: String) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if !self.transition(ClientState::Ready, ClientState::Error) {
            return;
        }

        let crash = McpError::ServerCrashed {
            name: self.spec.name.clone(),
            reason,
        };
        tracing::warn!(server = self.name(), error = %crash, "MCP server connection lost");
        self.record_error(&crash);

        // This task is the monitor; dropping its own handle just detaches it.
        let live = lock(&self.live).take();
        if let Some(live) = live {
            live.teardown.shutdown().await;
        }

        Self::schedule_restart(self);
    }

    /// Arm the restart timer if the policy allows another attempt.
    fn schedule_restart(self: &Arc<Self>) {
        let mut restart = lock(&self.restart);

        if self.state() == ClientState::Closed || !self.spec.restart_on_crash {
            return;
        }

        if restart.attempts >= self.spec.max_restarts {
            let exhausted = McpError::RestartExhausted {
                name: self.spec.name.clone(),
                attempts: restart.attempts,
            };
            tracing::error!(server = self.name(), "{exhausted}");
            self.record_error(&exhausted);
            return;
        }

        let delay = restart_delay(restart.attempts);
        restart.attempts += 1;
        tracing::info!(
            server = self.name(),
            attempt = restart.attempts,
            max = self.spec.max_restarts,
            delay_ms = duration_ms(delay),
            "scheduling MCP server restart"
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach our own handle so a later cancel can't abort this attempt.
            drop(lock(&inner.restart).timer.take());
            let _ = inner.connect_attempt().await;
        });
        // At most one armed timer per client.
        if let Some(previous) = restart.timer.replace(timer) {
            previous.abort();
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────

    async fn disconnect(&self) {
        {
            let mut restart = lock(&self.restart);
            if let Some(timer) = restart.timer.take() {
                timer.abort();
            }
            restart.attempts = 0;
            self.state_tx.send_replace(ClientState::Closed);
        }

        let live = lock(&self.live).take();
        if let Some(live) = live {
            if let Some(monitor) = live.monitor {
                monitor.abort();
            }
            live.teardown.shutdown().await;
            tracing::info!(server = self.name(), "MCP server disconnected");
        }
    }
}

/// Resolve once the state becomes `closed`.
async fn wait_for_close(rx: &mut watch::Receiver<ClientState>) {
    loop {
        if *rx.borrow_and_update() == ClientState::Closed {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender lives as long as the client; never resolves otherwise.
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl<C: Connector> ServerClient for SupervisedClient<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn spec(&self) -> &ServerSpec {
        &self.inner.spec
    }

    fn state(&self) -> ClientState {
        self.inner.state()
    }

    fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner
            .ready_session()
            .map(|session| session.tools.clone())
            .unwrap_or_default()
    }

    fn restart_attempts(&self) -> u32 {
        lock(&self.inner.restart).attempts
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    async fn connect(&self) -> Result<(), McpError> {
        self.inner.cancel_restart_timer();
        self.inner.connect_attempt().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        let session = self.inner.ready_session()?;
        let name = self.inner.name();

        let call = protocol::call_tool(session.transport.as_ref(), name, tool, arguments);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if e.is_transport_fault() => Err(McpError::ServerCrashed {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Timeout {
                server: name.to_string(),
                tool: tool.to_string(),
                timeout_ms: duration_ms(timeout),
            }),
        }
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let session = self.inner.ready_session()?;
        if !self.inner.spec.resources {
            return Ok(Vec::new());
        }
        match protocol::list_resources(session.transport.as_ref(), self.inner.name()).await {
            Ok(resources) => Ok(resources),
            // Fall back to the discovery snapshot if the live listing fails.
            Err(e) if !session.resources.is_empty() => {
                tracing::debug!(server = self.inner.name(), error = %e, "resources/list failed; using discovery snapshot");
                Ok(session.resources.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let session = self.inner.ready_session()?;
        protocol::read_resource(session.transport.as_ref(), self.inner.name(), uri).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
