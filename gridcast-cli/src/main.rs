//! Gridcast CLI - Command-line interface
//!
//! Runs the streaming server, prints encoder pipelines and watches a stream
//! headlessly.

mod commands;
mod playback;
mod watch;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gridcast_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "gridcast")]
#[command(about = "Multi-camera grid streaming server")]
#[command(version)]
struct Cli {
    /// Console log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to initialize logging")?;

    commands::handle_command(cli.command).await
}
