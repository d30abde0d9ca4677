//! WhisperRelay Daemon
//!
//! Relay server for end-to-end-encrypted chat: presence registry plus
//! encrypted-envelope routing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relayd::config::Config;
use relayd::server::RelayServer;

/// WhisperRelay daemon - presence registry and encrypted-envelope relay.
#[derive(Parser, Debug)]
#[command(name = "whisper-relayd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay server
    Start {
        /// Bind address override (e.g. 0.0.0.0:9300)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("WhisperRelay daemon starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Start { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            config.validate()?;

            let server = RelayServer::bind(
                &config.server.bind_addr,
                config.delivery.outbound_queue_depth,
            )
            .await?;
            tracing::info!(addr = %server.local_addr()?, "Listening for clients");

            tokio::select! {
                _ = server.run() => {}
                _ = wait_for_shutdown_signal() => {
                    tracing::info!("Received shutdown signal");
                }
            }
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
