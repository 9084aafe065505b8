//! Logging sink setup.
//!
//! stderr always; a per-run file under the log directory when `save_logs` is on.
//! `RUST_LOG` overrides the default `info` filter.

use crate::error::Result;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Writer handle shared between the subscriber and the guard.
#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

/// Keeps the log file open; flushes it when dropped.
pub struct LogGuard {
    file: Option<SharedFile>,
    path: Option<PathBuf>,
}

impl LogGuard {
    /// Path of the log file, if one is being written.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

/// `{log_dir}/{role}-{unix_ts}.log`
pub fn log_file_path(log_dir: &Path, role: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    log_dir.join(format!("{}-{}.log", role, ts))
}

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init(save_logs: bool, log_dir: &Path, role: &str) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_target(false);

    let (file, path) = if save_logs {
        fs::create_dir_all(log_dir)?;
        let path = log_file_path(log_dir, role);
        let file = SharedFile(Arc::new(Mutex::new(File::create(&path)?)));
        (Some(file), Some(path))
    } else {
        (None, None)
    };

    let file_layer = file.clone().map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(move || file.clone())
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(LogGuard { file, path })
}
