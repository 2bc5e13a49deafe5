use anyhow::{Context, Result};
use clap::Parser;

use deltatar::cli::DaemonOpts;
use deltatar::logger::init_tracing;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let config = opts.server_config()?;
    init_tracing(config.verbosity);

    println!("Starting deltatard:");
    println!("  Root: {}", config.root.display());
    println!("  Bind: {}", config.bind);
    println!(
        "  Fingerprints: {}",
        if config.fingerprint { "enabled" } else { "disabled" }
    );

    // Plain HTTP with no authentication; archives under the root are public
    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes every archive under the root to all network interfaces");
        eprintln!("   Consider binding to a specific interface (e.g., 192.168.1.100:8090)");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(deltatar::server::serve(config))
}
