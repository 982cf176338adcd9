//! CLI entry point for the NBIA fetcher.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nbia_fetch::cli::Cli;
use nbia_fetch::config::RunConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    // Config errors are fatal before any network I/O.
    let config = match RunConfig::resolve(cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(2);
        }
    };

    // Per-series failures are reported in the summary and still exit 0;
    // only fatal startup errors are non-zero.
    match nbia_fetch::run::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
