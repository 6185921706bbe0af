use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use session_tap::commands;
use session_tap::config;

#[derive(Parser, Debug)]
#[command(name = "session-tap")]
#[command(about = "Session fan-out, API stats relay and upstream routing for an intercepting proxy", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Validate configuration and print the effective settings
    Check,
    /// Replay recorded sessions (newline-delimited JSON) through the pipeline
    Replay {
        /// Recorded sessions file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print prometheus metrics after the replay
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("session_tap={log_level}").parse()?);
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .await
                .with_context(|| format!("failed to load configuration from {}", path.display()))?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file()
                .await
                .context("failed to load configuration")?
        }
    };

    match args.command {
        Command::Check => commands::run_config_check(config).await?,
        Command::Replay { input, metrics } => {
            tokio::select! {
                result = commands::run_replay(config, &input, metrics) => {
                    let summary = result.with_context(|| format!("replay of {} failed", input.display()))?;
                    info!(
                        "Replayed {} session(s), {} API session(s), {} rerouted",
                        summary.sessions, summary.api_sessions, summary.rerouted
                    );
                }
                _ = shutdown_signal() => {
                    info!("Replay interrupted");
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
