//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use mountns_driver::PeerUnmount;

#[derive(Parser)]
#[command(name = "mountns")]
#[command(about = "Mount namespace propagation test harness", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run propagation cases
    Run(RunArgs),

    /// List built-in cases
    List,

    /// Show namespace information
    Namespaces {
        /// Process ID (default: current process)
        #[arg(short, long)]
        pid: Option<u32>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Case to run, repeatable (default: every case)
    #[arg(short, long = "case", value_name = "NAME")]
    pub cases: Vec<String>,

    /// Checkpoint timeout in seconds, 0 waits forever
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    pub timeout: u64,

    /// Directory in which each case creates its A and B directories
    #[arg(long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Whether the observer also unmounts the phase mount
    #[arg(long, default_value = "exclusive", value_name = "exclusive|idempotent")]
    pub peer_unmount: PeerUnmount,

    /// Print one JSON report per line instead of text
    #[arg(long)]
    pub json: bool,

    /// Stop before phase 1 of every case until Enter is pressed (disables the timeout)
    #[arg(long)]
    pub pause: bool,
}
