//! Sandbox Daemon - multi-tenant sandbox orchestrator
//!
//! This daemon provisions per-user Linux sandboxes with persistent
//! workspaces, snapshots idle ones into an image registry, and brokers
//! authenticated websocket terminal sessions into running containers.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "sandbox-daemon")]
#[command(about = "Sandbox orchestrator: project lifecycle controller and terminal gateway")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sandbox_daemon={}", log_level).into()),
        )
        .init();

    if let Err(e) = cmd::root::run().await {
        error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
