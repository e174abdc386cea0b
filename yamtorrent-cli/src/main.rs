//! YamTorrent CLI - download a single torrent
//!
//! Parses arguments, sets up logging and hands the torrent to the core
//! download manager.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use yamtorrent_core::tracing_setup::{CliLogLevel, init_tracing};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "yamtorrent")]
#[command(about = "Download a torrent from its swarm")]
#[command(version)]
pub struct Cli {
    /// Path to a .torrent file; defaults to the only .torrent file in the current directory
    pub torrent: Option<PathBuf>,

    /// Directory the downloaded file is written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Port reported to the tracker
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,

    /// Raise the console log level (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory for the full trace log
    #[arg(long, default_value = "logs")]
    pub logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.raised_by(cli.verbose);
    init_tracing(level.as_tracing_level(), Some(&cli.logs_dir))
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    commands::download(cli).await
}
