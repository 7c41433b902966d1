//! threadscope - live conversation log watcher
//!
//! Watches a directory of project folders holding append-only `.jsonl`
//! conversation logs, threads the messages and streams increments to
//! WebSocket subscribers.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/threadscope/threadscope.db
//! - Logs: $XDG_STATE_HOME/threadscope/threadscope.log
//! - Config: $XDG_CONFIG_HOME/threadscope/config.toml

mod scan;
mod watch;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use threadscope_core::Config;

#[derive(Parser)]
#[command(name = "threadscope")]
#[command(about = "Watch conversation logs, thread them and stream the increments")]
#[command(version)]
struct Args {
    /// Config file (defaults to the XDG config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: watch, persist and serve the event stream
    Watch(watch::WatchArgs),
    /// Parse and thread conversation files once, without the daemon
    Scan(scan::ScanArgs),
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Watch(watch_args) => watch::run(config, watch_args),
        Command::Scan(scan_args) => scan::run(config, scan_args),
    }
}
