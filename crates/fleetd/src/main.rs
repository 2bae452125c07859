//! fleetd — the fleetgrid node daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config node.toml
//! fleetd check-config --config node.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use fleetgrid_service::NodeConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid node daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until Ctrl-C.
    Run {
        /// Node configuration file (TOML).
        #[arg(long, default_value = "fleetd.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "fleetd.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,fleetd=debug,fleetgrid=debug"))?;
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config } => {
            let config = NodeConfig::from_file(&config)?;
            fleetd::run(config).await
        }
        Command::CheckConfig { config } => {
            let parsed = NodeConfig::from_file(&config)?;
            info!(
                path = ?config,
                node = %parsed.node_name,
                peers = parsed.peers.len(),
                services = parsed.services.len(),
                "configuration is valid"
            );
            Ok(())
        }
    }
}
