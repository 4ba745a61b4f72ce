//! Command-line definition and execution.

use std::path::PathBuf;

use clap::Parser;
use monolayer_core::{FlattenConfig, FlattenError, Result};
use monolayer_runtime::Flattener;

use crate::output::summary_lines;

/// monolayer — flatten a multi-layer image export into a single layer.
#[derive(Parser, Debug)]
#[command(name = "monolayer", version, about)]
pub struct Cli {
    /// Input .tar image, from `docker save`
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory; a config.json and layer.tar are written to it
    #[arg(short, long)]
    pub output: PathBuf,

    /// Prefix for each output file
    #[arg(short, long)]
    pub prefix: Option<String>,
}

impl Cli {
    /// Build the immutable run configuration from parsed arguments.
    pub fn to_config(&self) -> Result<FlattenConfig> {
        FlattenConfig::new(&self.input, &self.output, self.prefix.clone())
    }
}

/// Convert a clap parse failure into a usage error.
///
/// `--help` and `--version` are not failures: clap prints them and the
/// process exits 0.
pub fn usage_error(err: clap::Error) -> FlattenError {
    if !err.use_stderr() {
        err.exit()
    }

    let rendered = err.to_string();
    let message = rendered
        .lines()
        .map(str::trim)
        .take_while(|line| !line.starts_with("Usage:"))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    FlattenError::UsageError(message.trim_start_matches("error: ").to_string())
}

/// Flatten the export named on the command line and print a summary.
pub fn execute(cli: Cli) -> Result<()> {
    let config = cli.to_config()?;
    tracing::debug!(
        input = %config.input().display(),
        output = %config.output_dir().display(),
        prefix = config.prefix(),
        "Starting flatten"
    );

    let report = Flattener::new(config).run()?;

    for line in summary_lines(&report) {
        println!("{}", line);
    }

    Ok(())
}
