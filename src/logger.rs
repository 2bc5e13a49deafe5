use crate::config::Verbosity;
use anyhow::Result;
use chrono::Utc;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Why a regular file could not be satisfied from the reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// No regular file at the candidate path (or the name is not resolvable)
    NotFound,
    /// Present but could not be copied, sized or hashed
    Unreadable,
    /// Readable, but content differs from the server's copy
    HashMismatch,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MissReason::NotFound => "not-found",
            MissReason::Unreadable => "unreadable",
            MissReason::HashMismatch => "hash-mismatch",
        })
    }
}

pub trait Logger: Send + Sync {
    fn start(&self, _source: &str, _destination: &Path) {}
    fn reused(&self, _name: &str, _bytes: u64) {}
    fn missing(&self, _name: &str, _reason: MissReason) {}
    fn fetched(&self, _name: &str, _bytes: u64) {}
    fn error(&self, _phase: &str, _msg: &str) {}
    fn done(&self, _reused: u64, _fetched: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, source: &str, destination: &Path) {
        self.line(&format!("START src={} dst={}", source, destination.display()));
    }
    fn reused(&self, name: &str, bytes: u64) {
        self.line(&format!("LOCAL name={} bytes={}", name, bytes));
    }
    fn missing(&self, name: &str, reason: MissReason) {
        self.line(&format!("MISSING name={} reason={}", name, reason));
    }
    fn fetched(&self, name: &str, bytes: u64) {
        self.line(&format!("FETCH name={} bytes={}", name, bytes));
    }
    fn error(&self, phase: &str, msg: &str) {
        self.line(&format!("ERROR phase={} msg={}", phase, msg));
    }
    fn done(&self, reused: u64, fetched: u64, seconds: f64) {
        self.line(&format!("DONE reused={reused} fetched={fetched} seconds={seconds:.3}"));
    }
}

/// Install the stderr tracing subscriber. `RUST_LOG` wins over `verbosity`.
pub fn init_tracing(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/sync.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.start("http://host/a.tgz", Path::new("/tmp/a.tgz"));
        logger.missing("a/y", MissReason::NotFound);
        logger.done(1, 1, 0.25);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("START src=http://host/a.tgz"));
        assert!(lines[1].ends_with("MISSING name=a/y reason=not-found"));
        assert!(lines[2].contains("DONE reused=1 fetched=1 seconds=0.250"));
    }
}
