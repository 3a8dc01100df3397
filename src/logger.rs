//! Structured logging contract (spec.md 6, "Logger").

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

pub trait Logger: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Default logger, forwarding to `tracing`. Install a subscriber (the binary does
/// this via `tracing_subscriber::fmt`) to see output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }
}

/// A per-session append-only log file, spec.md 6's `createSessionLogger`.
///
/// Every byte emitted by a worker subprocess on stdout/stderr is forwarded here
/// verbatim (spec.md 4.4) — this is a side-path, never the thing doing the stream
/// parsing for `session_id` (spec.md 9).
pub struct SessionLogger {
    file: File,
}

impl SessionLogger {
    pub fn create(stage_id: &str, log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let path = log_dir.join(format!("{stage_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open session log {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk)?;
        Ok(())
    }

    pub fn close(self) {
        // Dropping `self.file` flushes and closes the descriptor; explicit method
        // kept so call sites can say `.close()` per spec.md 6's contract shape.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_logger_appends_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = SessionLogger::create("STAGE-1", dir.path()).unwrap();
            logger.write(b"hello ").unwrap();
            logger.write(b"world").unwrap();
            logger.close();
        }
        let content = std::fs::read_to_string(dir.path().join("STAGE-1.log")).unwrap();
        assert_eq!(content, "hello world");
    }
}
