//! Stdio connections: spawn the server as a child process and speak JSON-RPC
//! over its stdin/stdout.
//!
//! Each connection owns a supervisor task that waits on the child. An exit
//! while connected is reported as a fault; a stop request runs the shutdown
//! sequence (SIGTERM, grace period, kill).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::client::{Connection, Connector, SupervisedClient, Teardown};
use super::config::ServerSpec;
use super::errors::McpError;
use super::transport::{FaultSender, StdioTransport};
use crate::credentials::CredentialResolver;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a server gets to exit after SIGTERM before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A client for a locally spawned stdio server.
pub type ProcessClient = SupervisedClient<ProcessConnector>;

impl ProcessClient {
    pub fn from_spec(
        spec: ServerSpec,
        credentials: Arc<CredentialResolver>,
    ) -> Result<Self, McpError> {
        SupervisedClient::new(spec, ProcessConnector, credentials)
    }
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Spawns one server process per connection attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn establish(
        &self,
        spec: &ServerSpec,
        credentials: &CredentialResolver,
    ) -> Result<Connection, McpError> {
        let name = spec.name.as_str();
        let spawn_failed = |reason: String| McpError::SpawnFailed {
            name: name.to_string(),
            reason,
        };

        let command = spec
            .command
            .as_deref()
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("stdio server '{name}' requires 'command'"),
            })?;

        let env = credentials
            .resolve_map(&spec.env)
            .await
            .map_err(|source| McpError::CredentialFailed {
                server: name.to_string(),
                source,
            })?;

        let mut cmd = Command::new(command);
        cmd.args(&spec.args);
        // Host environment is inherited; resolved values overlay it.
        cmd.envs(&env);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_failed(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        tracing::debug!(server = name, pid = ?child.id(), "spawned MCP server process");

        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new(name, stdin, stdout, faults_tx.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(name.to_string(), child, stop_rx, faults_tx));

        Ok(Connection {
            transport: Arc::new(transport),
            faults: faults_rx,
            teardown: Box::new(ProcessTeardown {
                stop: stop_tx,
                supervisor,
            }),
        })
    }
}

// ─── Supervision ─────────────────────────────────────────────────────────────

/// Forward each stderr line to the log at warn level.
async fn forward_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => tracing::warn!(server = %server, stderr = %line, "server stderr"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stopped reading server stderr");
                break;
            }
        }
    }
}

/// Wait for the child to exit (a fault) or for a stop request.
///
/// A dropped stop sender counts as a stop request.
async fn supervise(
    server: String,
    mut child: Child,
    mut stop: oneshot::Receiver<()>,
    faults: FaultSender,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("process exited ({status})"),
                Err(e) => format!("failed to wait on process: {e}"),
            };
            let _ = faults.send(reason);
        }
        _ = &mut stop => {
            terminate(&server, &mut child).await;
        }
    }
}

/// SIGTERM, wait up to [`SHUTDOWN_GRACE`], then kill.
async fn terminate(server: &str, child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    send_terminate(server, child);

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server, %status, "MCP server process exited");
        }
        _ => {
            tracing::warn!(
                server,
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "server did not exit after SIGTERM; killing"
            );
            if let Err(e) = child.kill().await {
                tracing::debug!(server, error = %e, "failed to kill server process");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(server: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(server, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(server: &str, child: &mut Child) {
    // No graceful signal here; the grace period still applies to the exit.
    if let Err(e) = child.start_kill() {
        tracing::debug!(server, error = %e, "failed to terminate server process");
    }
}

/// Stops the supervisor (and with it the process).
struct ProcessTeardown {
    stop: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

#[async_trait]
impl Teardown for ProcessTeardown {
    async fn shutdown(self: Box<Self>) {
        let ProcessTeardown { stop, supervisor } = *self;
        let _ = stop.send(());
        let _ = supervisor.await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::client::ServerClient;
    use crate::mcp_client::types::ClientState;

    fn credentials() -> Arc<CredentialResolver> {
        Arc::new(CredentialResolver::with_defaults())
    }

    #[test]
    fn test_from_spec_requires_command() {
        let mut spec = ServerSpec::stdio("fs", "ignored");
        spec.command = None;
        let err = ProcessClient::from_spec(spec, credentials()).err().unwrap();
        assert!(err.to_string().contains("command"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_failure() {
        let spec = ServerSpec::stdio("ghost", "/definitely/not/a/real/binary");
        let err = ProcessConnector
            .establish(&spec, &CredentialResolver::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_unresolved_env_fails_before_spawn() {
        let mut spec = ServerSpec::stdio("fs", "/definitely/not/a/real/binary");
        spec.env.insert(
            "API_TOKEN".into(),
            "secret://env/MCP_BRIDGE_TEST_PROCESS_UNSET".into(),
        );
        let err = ProcessConnector
            .establish(&spec, &CredentialResolver::with_defaults())
            .await
            .err()
            .unwrap();
        // Credential failure wins over the (also broken) command.
        assert!(matches!(err, McpError::CredentialFailed { .. }));
    }

    #[tokio::test]
    async fn test_exit_before_handshake_fails_connect() {
        let mut spec = ServerSpec::stdio("quitter", "sh");
        spec.args = vec!["-c".into(), "echo boom >&2; exit 3".into()];
        spec.restart_on_crash = false;
        let client = ProcessClient::from_spec(spec, credentials()).unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }), "{err}");
        assert_eq!(client.state(), ClientState::Error);
    }

    #[tokio::test]
    async fn test_teardown_terminates_process() {
        let mut spec = ServerSpec::stdio("sleeper", "sleep");
        spec.args = vec!["30".into()];

        let connection = ProcessConnector
            .establish(&spec, &CredentialResolver::new())
            .await
            .unwrap();
        let started = std::time::Instant::now();
        connection.teardown.shutdown().await;
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }
}
