//! Helper process that spawns and supervises children for a proclaunch host
//!
//! Started by `LauncherInterface::start` with the path of the host's socket as
//! its only argument. Logs go to stderr, which the host forwards into its own
//! log.

mod handler;
mod process;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
const LOG_ENV: &str = "PROCLAUNCH_LOG";

#[derive(Parser, Debug)]
#[command(name = "proclaunch-launcher")]
#[command(about = "Spawns processes on behalf of a proclaunch host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Socket the host is listening on
    server_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(handler::run(&args.server_path))
}
