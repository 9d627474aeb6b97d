//! Mount propagation test harness CLI
//!
//! Exit code of `run`: bit 1 set when a case failed, bit 2 when a case
//! broke, 32 when every case was skipped for lack of privileges.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod sink;

use cli::Cli;

/// Exit code for errors outside any case (bad arguments, unreadable /proc)
const USAGE_EXIT_CODE: i32 = 2;

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match commands::dispatch(cli.command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(USAGE_EXIT_CODE);
        }
    }
}
