//! Per-run append-only log files.
//!
//! A run has exactly one [`LogWriter`] (owned by its supervisor) and any
//! number of readers going through [`tail::read_from`]. Readers never take
//! the writer's lock; they only ever see a prefix of what has been appended.

pub mod tail;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use self::tail::{read_from, LineSplitter};

/// Name of the log file inside a run's artifact directory.
pub const LOG_FILE_NAME: &str = "run.log";

/// Append handle for one run's log file.
///
/// Appends are serialized through a `tokio::sync::Mutex` so the stdout and
/// stderr pumps can share the handle without interleaving inside a chunk.
pub struct LogWriter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl LogWriter {
    /// Open (or create) the log at `path` in append mode.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), "run log opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` and flush them to the OS before returning.
    pub async fn try_append(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes)
            .await
            .with_context(|| format!("failed to write run log: {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush run log: {}", self.path.display()))?;
        Ok(())
    }

    /// Best-effort append: failures are logged and swallowed so that a
    /// broken log never fails the run itself.
    pub async fn append(&self, bytes: &[u8]) {
        if let Err(e) = self.try_append(bytes).await {
            warn!(path = %self.path.display(), error = %e, "log append failed");
        }
    }

    /// Append a line of text, adding the trailing newline.
    pub async fn append_line(&self, line: &str) {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.append(buf.as_bytes()).await;
    }
}
