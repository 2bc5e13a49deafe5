//! Command-line options for both binaries

use crate::config::{MergeOrder, ServerConfig, Verbosity};
use clap::Parser;
use std::path::PathBuf;

/// Client options (`deltatar`)
#[derive(Clone, Debug, Parser)]
#[command(
    name = "deltatar",
    author,
    version,
    about = "Rebuild a remote .tgz locally, downloading only the files your reference tree lacks"
)]
pub struct ClientOpts {
    /// Source archive URL (must end in .tgz)
    #[arg(long = "src", value_name = "URL")]
    pub src: String,

    /// Destination directory or .tgz path
    #[arg(long = "dst", value_name = "PATH", default_value = "./")]
    pub dst: PathBuf,

    /// Reference directory whose files may satisfy archive entries
    #[arg(long = "ref", value_name = "DIR", default_value = "/")]
    pub reference: PathBuf,

    /// Log every entry as it is processed
    #[arg(long, conflicts_with = "quiet")]
    pub debug: bool,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Where fetched entries go in the output archive
    #[arg(long, value_enum, default_value_t = MergeOrder::Original)]
    pub order: MergeOrder,

    /// Read/write timeout for each request, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Directory for the per-sync scratch files (default: system temp dir)
    #[arg(long, value_name = "DIR")]
    pub scratch: Option<PathBuf>,

    /// Append per-file outcomes to this log file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Print the sync report as JSON
    #[arg(long)]
    pub json: bool,
}

impl ClientOpts {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.debug, self.quiet)
    }
}

/// Daemon options (`deltatard`)
#[derive(Clone, Debug, Parser)]
#[command(
    name = "deltatard",
    author,
    version,
    about = "Serve .tgz archives as index and diff streams"
)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding the source archives
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML config file; flags given on the command line take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log every entry as it is processed
    #[arg(long)]
    pub debug: bool,

    /// Read/write timeout for each request, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Do not hand out or check archive fingerprints
    #[arg(long)]
    pub no_fingerprint: bool,
}

impl DaemonOpts {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(secs) = self.timeout {
            config.io_timeout_secs = secs;
        }
        if self.debug {
            config.verbosity = Verbosity::Debug;
        }
        if self.no_fingerprint {
            config.fingerprint = false;
        }
        Ok(config)
    }
}
