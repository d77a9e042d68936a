//! # weftd entry point
//!
//! Parses the CLI, initializes tracing, and hands off to the daemon.
//! `RUST_LOG` controls verbosity (default `info`).

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use weft_node::cli::{run, status, Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Run(args)) => run(args).await,
        Some(Command::Status(args)) => status(args).await,
        None => run(RunArgs::default()).await,
    }
}
