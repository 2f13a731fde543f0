pub mod config;
pub mod facade;
pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use config::ClientConfig;
pub use facade::{ConnectionStatus, ResearchClient, ResearchError};
pub use mcp_client::{ConnectionState, McpClient, McpError, OperationIntent};

/// Number of rotated log files kept next to the current one.
const LOG_ROTATIONS: u32 = 3;

/// Return the platform-standard data directory for Reposcope.
///
/// - macOS: `~/Library/Application Support/reposcope/`
/// - Windows: `{FOLDERID_RoamingAppData}\reposcope\`
/// - Linux: `$XDG_DATA_HOME/reposcope/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.reposcope/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("reposcope");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".reposcope")
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// On each start:
/// 1. Rotates existing logs (reposcope.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh reposcope.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// The filter comes from `RUST_LOG`, defaulting to `reposcope=info,warn`.
/// Returns the path of the log file.
pub fn init_tracing(log_dir: &Path, json: bool) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("reposcope.log");
    rotate_log_file(&log_path, LOG_ROTATIONS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reposcope=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| std::io::Error::other(format!("failed to install subscriber: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== reposcope starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `reposcope.log` → `reposcope.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
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

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("reposcope.log");
        for (name, body) in [
            ("reposcope.log", "current"),
            ("reposcope.log.1", "one"),
            ("reposcope.log.2", "two"),
            ("reposcope.log.3", "three"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |n: &str| std::fs::read_to_string(dir.path().join(n)).unwrap();
        assert_eq!(read("reposcope.log.1"), "current");
        assert_eq!(read("reposcope.log.2"), "one");
        assert_eq!(read("reposcope.log.3"), "two");
    }

    #[test]
    fn test_rotate_log_file_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("reposcope.log");
        std::fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);

        assert!(dir.path().join("reposcope.log.1").exists());
        assert!(!dir.path().join("reposcope.log.2").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_data_dir_is_named() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("reposcope"));
    }
}
