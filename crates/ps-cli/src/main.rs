//! pairsync CLI
//!
//! Watches a backend's device pairing status and chats with its agent:
//! - `status` / `health` for one-shot checks
//! - `watch` to follow pairing status over push, falling back to polling
//! - `chat` to stream replies, one turn or interactively

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairsync::commands;
use pairsync::output::print_error;
use ps_core::config::{self, API_URL_ENV};

#[derive(Parser)]
#[command(name = "pairsync")]
#[command(author, version, about = "Device pairing status and streamed chat client")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend address (overrides config and environment)
    #[arg(long, global = true, env = API_URL_ENV)]
    api_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the pairing status once
    Status {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Follow pairing status until interrupted
    Watch {
        /// Exit once the device is paired
        #[arg(long)]
        until_paired: bool,
        /// Write the latest pairing code payload to this file
        #[arg(long, value_name = "PATH")]
        save_code: Option<PathBuf>,
    },

    /// Chat with the backend agent
    Chat {
        /// Message to send. Starts an interactive session if omitted
        message: Option<String>,
        /// Use the request/response endpoint instead of streaming
        #[arg(long)]
        no_stream: bool,
    },

    /// Check that the backend is reachable
    Health,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Commands::Config { action } = &cli.command {
        let path = cli.config.as_ref();
        return match action {
            ConfigAction::Show => commands::config_show(path),
            ConfigAction::Get { key } => commands::config_get(path, key),
            ConfigAction::Set { key, value } => commands::config_set(path, key, value),
            ConfigAction::Init { force } => commands::config_init(path, *force),
            ConfigAction::Path => {
                commands::config_path(path);
                Ok(())
            }
        };
    }

    let mut client = config::resolve_client_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(api_url) = cli.api_url {
        client.api_url = api_url;
    }
    if let Err(e) = client.validate() {
        print_error(&format!("Invalid configuration: {}", e));
        return Err(e.into());
    }
    tracing::debug!(api_url = %client.api_url, "Using backend");

    match cli.command {
        Commands::Status { json } => commands::status_command(client, json).await,
        Commands::Health => commands::health_command(client).await,
        Commands::Watch {
            until_paired,
            save_code,
        } => commands::watch_command(client, until_paired, save_code, shutdown_signal()).await,
        Commands::Chat { message, no_stream } => {
            commands::chat_command(client, message, no_stream, shutdown_signal()).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Token cancelled on Ctrl+C or SIGTERM
fn shutdown_signal() -> CancellationToken {
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }

        cancel_clone.cancel();
    });

    cancel
}
