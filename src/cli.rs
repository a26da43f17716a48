//! CLI definitions for flowplane.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "flowplane",
    version,
    about = "Stateful L4 load-balancer data plane workbench\n\nReplay captured traffic through the flow-tracking fast path, publish telemetry over shared memory, and feed weight updates back in.",
    long_about = None
)]
pub struct Cli {
    /// Path to flowplane.toml config file
    #[clap(long, short, default_value = "flowplane.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print an example flowplane.toml to stdout
    Init,

    /// Replay a pcap file through the data plane and report telemetry
    Replay {
        /// Capture file to replay
        pcap: PathBuf,

        /// Write JSONL snapshots to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,

        /// Keep the shared-memory region after the replay finishes,
        /// so an external consumer can inspect the final state
        #[clap(long)]
        keep_shm: bool,
    },

    /// Run the reference weight consumer against a live data plane
    Consume {
        /// Seconds between weight updates
        #[clap(long, default_value = "0.2")]
        interval: f64,

        /// Stop after this many updates (default: run forever)
        #[clap(long)]
        count: Option<u64>,
    },

    /// Sample the host CPU load from /proc/stat
    Cpu {
        /// Seconds between samples
        #[clap(long, default_value = "1.0")]
        interval: f64,

        /// Number of samples to print
        #[clap(long, default_value = "10")]
        count: u64,
    },
}
