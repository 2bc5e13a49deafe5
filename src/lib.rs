//! deltatar library
//!
//! Content-addressed tar.gz synchronization: a client rebuilds a server-held
//! archive from its own reference tree and downloads only the regular files
//! whose content it does not already have.

pub mod bitmap;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod counter;
pub mod diff;
pub mod error;
pub mod index;
pub mod logger;
pub mod merge;
pub mod paths;
pub mod protocol;
pub mod scan;
pub mod server;
pub mod tar_stream;
pub mod url;

pub use client::{HttpTransport, SyncClient, SyncPhase, SyncReport, Transport};
pub use config::{ClientConfig, MergeOrder, ServerConfig, Verbosity};
pub use error::{DiffError, DiffResult};
