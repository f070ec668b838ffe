//! Burrow relay binary
//!
//! Binds the three listeners (edge, tunnel endpoint, dashboard), runs
//! migrations, and shuts everything down cleanly on interrupt.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_db::Store;
use burrow_relay::config::{parse_custom_domain, RelayConfig, TlsPaths};
use burrow_relay::{
    edge, AliasAllocator, ControlServer, DashboardBroadcaster, DashboardServer, TunnelRegistry,
};

/// Burrow relay - expose local services on public subdomains
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Burrow relay - expose local services on public subdomains")]
#[command(version)]
struct Cli {
    /// Base domain public URLs are formed under (e.g. tunnel.example.com)
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: String,

    /// Public HTTP listener address
    #[arg(long, env = "BURROW_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Tunnel control-channel listener address
    #[arg(long, env = "BURROW_CONTROL_ADDR", default_value = "0.0.0.0:9000")]
    control_addr: SocketAddr,

    /// Dashboard observer listener address
    #[arg(long, env = "BURROW_DASHBOARD_ADDR", default_value = "0.0.0.0:9001")]
    dashboard_addr: SocketAddr,

    /// TLS certificate path (PEM). When set, all listeners serve TLS directly.
    #[arg(long, env = "BURROW_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key path (PEM)
    #[arg(long, env = "BURROW_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Storage DSN (e.g. postgres://burrow@db-host/burrow)
    #[arg(long, env = "BURROW_DB_URL")]
    db_url: String,

    /// Storage password (required)
    #[arg(long, env = "BURROW_DB_PASSWORD")]
    db_password: String,

    /// Persisted-alias quota per user
    #[arg(long, env = "BURROW_MAX_ALIASES", default_value = "5")]
    max_aliases_per_user: u64,

    /// Custom domain mapping host=alias, consulted before subdomain parsing
    /// (repeatable)
    #[arg(long = "custom-domain", value_parser = parse_custom_domain)]
    custom_domains: Vec<(String, String)>,

    /// Seconds to wait for an agent response before replying 504
    #[arg(long, env = "BURROW_REQUEST_DEADLINE", default_value = "60")]
    request_deadline: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<RelayConfig> {
        let database_url = RelayConfig::database_url(&self.db_url, &self.db_password)?;

        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsPaths {
                cert_path,
                key_path,
            }),
            _ => None,
        };

        Ok(RelayConfig {
            base_domain: self.domain,
            http_addr: self.http_addr,
            control_addr: self.control_addr,
            dashboard_addr: self.dashboard_addr,
            tls,
            database_url,
            max_aliases_per_user: self.max_aliases_per_user,
            custom_domains: self.custom_domains.into_iter().collect(),
            request_deadline: Duration::from_secs(self.request_deadline),
        })
    }
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

    let config = cli.into_config()?;
    info!("Burrow relay starting (domain: {})", config.base_domain);

    // Validate TLS material before anything binds
    let tls_acceptor = config.build_tls_acceptor()?;

    let db = burrow_db::connect(&config.database_url)
        .await
        .context("Storage unreachable at startup")?;
    burrow_db::migrate(&db)
        .await
        .context("Database migration failed")?;
    let store = Store::new(db);

    let registry = Arc::new(TunnelRegistry::new(config.base_domain.clone()));
    let allocator = Arc::new(AliasAllocator::new(
        store.clone(),
        registry.clone(),
        config.max_aliases_per_user,
    ));
    let broadcaster = Arc::new(DashboardBroadcaster::new(registry.clone()));

    // Tunnel endpoint
    let control_listener = TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("Failed to bind tunnel listener on {}", config.control_addr))?;
    let control = Arc::new(ControlServer::new(
        registry.clone(),
        allocator,
        broadcaster.clone(),
    ));
    let mut control_task = tokio::spawn(control.run(control_listener, tls_acceptor.clone()));

    // Dashboard fan-out
    let dashboard_listener = TcpListener::bind(config.dashboard_addr)
        .await
        .with_context(|| {
            format!(
                "Failed to bind dashboard listener on {}",
                config.dashboard_addr
            )
        })?;
    let mut dashboard_task =
        tokio::spawn(DashboardServer::new(broadcaster.clone()).run(dashboard_listener, tls_acceptor));
    let ticker_task = tokio::spawn(broadcaster.clone().run_ticker());

    // Public edge
    let edge_state = Arc::new(edge::EdgeState {
        registry: registry.clone(),
        store: store.clone(),
        custom_domains: config.custom_domains.clone(),
        request_deadline: config.request_deadline,
    });
    let app = edge::router(edge_state);

    let mut edge_task = match config.tls {
        Some(ref paths) => {
            let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &paths.cert_path,
                &paths.key_path,
            )
            .await
            .context("Failed to load TLS certificates for the edge listener")?;

            info!("✅ Edge listening on https://{}", config.http_addr);
            let addr = config.http_addr;
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, rustls_config)
                    .serve(app.into_make_service())
                    .await
            })
        }
        None => {
            let listener = TcpListener::bind(config.http_addr)
                .await
                .with_context(|| format!("Failed to bind edge listener on {}", config.http_addr))?;

            info!("✅ Edge listening on http://{}", config.http_addr);
            tokio::spawn(async move { axum::serve(listener, app).await })
        }
    };

    // The api_requests.port column comes from x-forwarded-port; it stays 0
    // unless a fronting proxy sets that header.
    info!("Request-log port is read from x-forwarded-port (0 without a proxy that sets it)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down...");
        }
        result = &mut control_task => {
            anyhow::bail!("Tunnel endpoint stopped unexpectedly: {:?}", result);
        }
        result = &mut dashboard_task => {
            anyhow::bail!("Dashboard stopped unexpectedly: {:?}", result);
        }
        result = &mut edge_task => {
            anyhow::bail!("Edge server stopped unexpectedly: {:?}", result);
        }
    }

    // Stop accepting, then close every tunnel: waiting edge handlers observe
    // the abort and fail fast instead of blocking.
    control_task.abort();
    dashboard_task.abort();
    edge_task.abort();
    ticker_task.abort();

    let tunnels = registry.drain();
    if !tunnels.is_empty() {
        info!("Closing {} tunnels", tunnels.len());
    }
    for tunnel in tunnels {
        tunnel.mark_closed();
        tunnel.pending.abort_all();
    }

    store.close().await.ok();
    info!("Burrow relay stopped");

    Ok(())
}
