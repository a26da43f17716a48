//! flowplane — stateful L4 load-balancer data plane workbench.
//!
//! Replays captured traffic through the flow-tracking fast path, publishes
//! telemetry frames over shared memory, and runs the reference weight
//! consumer on the other side of the ring. Run `flowplane --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod consume;
mod cpuload;
mod parse;
mod replay;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config (except for `init` and `cpu`, which don't need it)
    let config = match &cli.command {
        Commands::Init | Commands::Cpu { .. } => None,
        _ => {
            if cli.config.exists() {
                Some(config::FlowplaneConfig::load(&cli.config)?)
            } else {
                eprintln!(
                    "'{}' not found — using defaults. Run `flowplane init > {}` to customise.",
                    cli.config.display(),
                    cli.config.display()
                );
                Some(config::FlowplaneConfig::default())
            }
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::FlowplaneConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Replay { pcap, output, keep_shm } => {
            replay::run(config.as_ref().unwrap(), &pcap, output, keep_shm)?;
        }
        Commands::Consume { interval, count } => {
            consume::run(config.as_ref().unwrap(), interval, count)?;
        }
        Commands::Cpu { interval, count } => {
            cpuload::run(interval, count)?;
        }
    }

    Ok(())
}
