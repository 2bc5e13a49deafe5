//! deltatar - rebuild a remote .tgz from a local reference tree
//!
//! Downloads the archive's index, satisfies every regular file it can from
//! `--ref`, and fetches only the rest.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use deltatar::cli::ClientOpts;
use deltatar::logger::{init_tracing, Logger, NoopLogger, TextLogger};
use deltatar::url::resolve_destination;
use deltatar::{ClientConfig, HttpTransport, SyncClient, SyncReport, Verbosity};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT; the destination is only ever replaced by a rename
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    let verbosity = opts.verbosity();
    init_tracing(verbosity);

    let destination = resolve_destination(&opts.src, &opts.dst)?;
    if !opts.reference.is_dir() {
        anyhow::bail!("Reference directory does not exist: {}", opts.reference.display());
    }

    let logger: Arc<dyn Logger> = match &opts.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("Failed to open log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let mut config = ClientConfig::new(opts.src.clone(), destination, opts.reference.clone());
    config.merge_order = opts.order;
    config.scratch_dir = opts.scratch.clone();
    config.verbosity = verbosity;
    if let Some(secs) = opts.timeout {
        config.io_timeout = Duration::from_secs(secs);
    }

    let transport = HttpTransport::new(&opts.src, config.io_timeout);
    let report = SyncClient::new(transport, config, logger).run()?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if verbosity != Verbosity::Quiet {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &SyncReport) {
    let total = report.reused + report.fetched;
    println!("Wrote {}", report.destination);
    println!(
        "  {} regular files: {} from reference ({}), {} downloaded",
        total,
        report.reused,
        format_bytes(report.bytes_reused),
        report.fetched
    );
    println!(
        "  Transferred: index {} + diff {} in {:.2}s",
        format_bytes(report.index_bytes),
        format_bytes(report.diff_bytes),
        report.seconds
    );
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
