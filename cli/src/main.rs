//! monolayer CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use monolayer_cli::commands::{execute, usage_error, Cli};

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = Cli::try_parse().map_err(usage_error).and_then(execute);

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
