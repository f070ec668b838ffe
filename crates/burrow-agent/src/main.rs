//! Burrow agent CLI
//!
//! Publish a local port through a burrow relay with automatic reconnection.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig};
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - publish a local port on a public subdomain
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - publish a local port on a public subdomain")]
#[command(version)]
#[command(long_about = r#"
Connect to a burrow relay and serve a local port on a public subdomain.
Automatically reconnects if the control channel drops.

EXAMPLES:
  # Expose local port 3000 anonymously (session ends after an hour)
  burrow --relay wss://tunnel.example.com:9000 --port 3000

  # Expose with a user token so the subdomain is stable across restarts
  burrow --relay wss://tunnel.example.com:9000 --port 3000 --token $BURROW_TOKEN

ENVIRONMENT VARIABLES:
  BURROW_RELAY   Relay control-channel URL
  BURROW_TOKEN   User token
  BURROW_PORT    Local port to publish
"#)]
struct Cli {
    /// Relay control-channel URL (ws:// or wss://)
    #[arg(long, env = "BURROW_RELAY")]
    relay: String,

    /// Local port the origin listens on
    #[arg(short, long, env = "BURROW_PORT")]
    port: u16,

    /// User token; omit for an anonymous session
    #[arg(long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Keepalive ping interval in seconds
    #[arg(long, default_value = "20")]
    keepalive_interval: u64,

    /// Delay before redialing a dropped control channel, in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay: u64,

    /// Timeout for requests against the local origin, in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Anonymous sessions exit after this many seconds
    #[arg(long, default_value = "3600")]
    session_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("Burrow agent starting...");
    info!("Relay: {}", cli.relay);
    info!("Local port: {}", cli.port);
    if cli.token.is_none() {
        info!(
            "Anonymous session (exits after {}s); pass --token for a stable subdomain",
            cli.session_timeout
        );
    }

    let config = AgentConfig {
        control_url: cli.relay,
        user_token: cli.token,
        local_port: cli.port,
        keepalive_interval: Duration::from_secs(cli.keepalive_interval),
        reconnect_delay: Duration::from_secs(cli.reconnect_delay),
        request_timeout: Duration::from_secs(cli.request_timeout),
        anonymous_session_timeout: Duration::from_secs(cli.session_timeout),
    };

    let agent = Agent::new(config).context("Failed to create agent")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = agent.run() => {
            result.context("Agent stopped with an error")?;
        }
    }

    info!("Burrow agent stopped");
    Ok(())
}
