//! WatchSec Agent Daemon
//!
//! Runs on the monitored host, keeps a control connection to the relay hub
//! and serves remote sessions on request.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchsec_agent::platform;
use watchsec_agent::{AgentRuntime, AgentState};
use watchsec_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "watchsec-agent")]
#[command(about = "WatchSec agent - streams this host's screen to the relay hub")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "WATCHSEC_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Hub websocket URL (overrides config)
    /// Example: wss://hub.example.com
    #[arg(long)]
    hub: Option<String>,

    /// Agent id presented to the hub (defaults to hostname)
    #[arg(long)]
    agent_id: Option<String>,

    /// Per-tenant API key (overrides config)
    #[arg(long, env = "WATCHSEC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Never attempt peer-to-peer; always relay through the hub
    #[arg(long)]
    relay_only: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("WatchSec agent starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_agent_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                AgentConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            AgentConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(hub) = args.hub {
        config.hub_url = hub;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = Some(agent_id);
    }
    if let Some(api_key) = args.api_key {
        config.api_key = api_key;
    }
    if args.relay_only {
        config.peer.enabled = false;
    }
    config.validate().context("Invalid agent configuration")?;

    let backend = platform::select_backend();
    let state = AgentState::new(config, backend);
    tracing::info!("Agent id: {}", state.agent_id);
    tracing::info!("Recordings stored in {:?}", state.config.recording.directory);

    // Setup signal handlers
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
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
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        signal_cancel.cancel();
    });

    AgentRuntime::new(state)
        .run(cancel)
        .await
        .context("Agent stopped")?;

    tracing::info!("Agent shutdown complete");
    Ok(())
}
