//! Tracing subscriber setup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Name of the active log file inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-bridge.log";

/// Rotated logs kept next to the active one.
pub const KEEP_ROTATED: u32 = 3;

const DEFAULT_FILTER: &str = "mcp_bridge=info,warn";

/// Set by the call to [`init_tracing`] that installed the subscriber.
static ACTIVE_LOG: OnceLock<PathBuf> = OnceLock::new();

/// Platform data directory for this crate's files.
///
/// Falls back to `~/.mcp-bridge/` only if no data directory can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-bridge")
}

/// Install the global subscriber, writing to `<log_dir>/mcp-bridge.log`.
///
/// Previous logs are rotated (`.1` … `.3`) first. The filter comes from
/// `RUST_LOG`, defaulting to `mcp_bridge=info,warn`.
///
/// Only the first successful call touches the log directory. Later calls, or
/// calls made after some other global subscriber was installed, leave every
/// file alone and return the path already being written.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);
    let log_path = log_dir.join(LOG_FILE_NAME);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let writer = FlushingWriter::detached();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer.clone())
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return Ok(ACTIVE_LOG.get().cloned().unwrap_or(log_path));
    }

    std::fs::create_dir_all(&log_dir)?;
    rotate_log_file(&log_path, KEEP_ROTATED);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    writer.attach(log_file);
    let _ = ACTIVE_LOG.set(log_path.clone());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %chrono::Utc::now().to_rfc3339(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-bridge starting ==="
    );

    Ok(log_path)
}

/// Rotate `name.log` → `name.log.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Gaps in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write so lines survive a crash.
///
/// A writer with no file attached discards its input.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl FlushingWriter {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(Some(file))),
        }
    }

    fn detached() -> Self {
        Self {
            file: Arc::new(Mutex::new(None)),
        }
    }

    fn attach(&self, file: File) {
        if let Ok(mut slot) = self.file.lock() {
            *slot = Some(file);
        }
    }

    fn slot(&self) -> std::io::Result<MutexGuard<'_, Option<File>>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut slot = self.slot()?;
        let Some(f) = slot.as_mut() else {
            return Ok(buf.len());
        };
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.slot()?.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Test Capture ────────────────────────────────────────────────────────────

/// In-memory sink for asserting on emitted log lines.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl CapturedLogs {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's events into a [`CapturedLogs`] until the guard drops.
#[cfg(test)]
pub(crate) fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
