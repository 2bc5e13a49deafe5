//! Runtime configuration for the client and the daemon.
//!
//! Nothing here is process-global: every transform receives the settings it
//! needs (most often just a [`Verbosity`]) through its entry point.

use crate::protocol::{timeouts, DEFAULT_BIND, DEFAULT_CHUNK_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How much per-entry detail the transforms report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Debug,
}

impl Verbosity {
    pub fn from_flags(debug: bool, quiet: bool) -> Self {
        if debug {
            Verbosity::Debug
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    /// Whether individual archive entries should be logged.
    pub fn entries(self) -> bool {
        self == Verbosity::Debug
    }

    /// Default tracing filter directive for this level.
    pub fn filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Where fetched files land in the rebuilt archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeOrder {
    /// Fetched entries are spliced back at their position in the source.
    #[default]
    Original,
    /// Fetched entries follow all locally satisfied entries.
    Appended,
}

/// Daemon configuration; loadable from TOML, overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (host:port)
    pub bind: String,
    /// Directory holding the source archives
    pub root: PathBuf,
    /// Blanket read/write deadline at the transport
    pub io_timeout_secs: u64,
    /// Size of each streamed response chunk in bytes
    pub chunk_size: usize,
    /// Hand out and check whole-archive fingerprints
    pub fingerprint: bool,
    pub verbosity: Verbosity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            root: PathBuf::from("."),
            io_timeout_secs: timeouts::IO_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fingerprint: true,
            verbosity: Verbosity::Normal,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings no daemon can run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be at least 1 byte");
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Everything one client sync needs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Source archive URL, ending in `.tgz`
    pub source_url: String,
    /// Final path of the rebuilt archive
    pub destination: PathBuf,
    /// Local tree whose files may satisfy index entries
    pub reference: PathBuf,
    /// Parent for the per-sync scratch directory (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    pub merge_order: MergeOrder,
    pub io_timeout: Duration,
    pub verbosity: Verbosity,
}

impl ClientConfig {
    pub fn new(source_url: impl Into<String>, destination: PathBuf, reference: PathBuf) -> Self {
        Self {
            source_url: source_url.into(),
            destination,
            reference,
            scratch_dir: None,
            merge_order: MergeOrder::default(),
            io_timeout: Duration::from_secs(timeouts::IO_SECS),
            verbosity: Verbosity::Normal,
        }
    }
}
