//! fbtunnel server binary
//!
//! Accepts remote database clients on a public TCP port and bridges each
//! one to the private backend through a single authenticated agent control
//! stream.

use anyhow::{Context, Result};
use clap::Parser;
use fbtunnel_server::{listen_addr, ServerConfig, TunnelServer};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// fbtunnel server - exposes a private TCP backend through a reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "fbtunnel-server")]
#[command(about = "fbtunnel server - exposes a private TCP backend through a reverse tunnel")]
#[command(version)]
#[command(long_about = r#"
The fbtunnel server accepts remote clients on a public TCP port and relays
their traffic to an agent running next to the backend. Only the agent dials
out, so the backend can sit behind NAT or a firewall.

ENVIRONMENT VARIABLES:
  TUNNEL_EXTERNAL_PORT  Public TCP listener for remote clients
  TUNNEL_GRPC_PORT      Control-stream listener for the agent
  TUNNEL_AUTH_TOKEN     Shared secret the agent must present
  TUNNEL_SERVER_CERT    TLS certificate chain (PEM)
  TUNNEL_SERVER_KEY     TLS private key (PEM)
  TUNNEL_INSECURE       "true" disables TLS (never in production)
  TUNNEL_MAX_TUNNELS    Optional cap on concurrent tunnels
"#)]
struct Args {
    /// Public TCP listener for remote clients (port or host:port)
    #[arg(long, env = "TUNNEL_EXTERNAL_PORT")]
    external_port: String,

    /// Control-stream listener for the agent (port or host:port)
    #[arg(long, env = "TUNNEL_GRPC_PORT")]
    grpc_port: String,

    /// Shared secret for agent authentication
    #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
    auth_token: String,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "TUNNEL_SERVER_CERT")]
    server_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "TUNNEL_SERVER_KEY")]
    server_key: Option<PathBuf>,

    /// Disable TLS on the control channel (never in production)
    #[arg(long, env = "TUNNEL_INSECURE")]
    insecure: bool,

    /// Maximum concurrent tunnels (unlimited if unset)
    #[arg(long, env = "TUNNEL_MAX_TUNNELS")]
    max_tunnels: Option<usize>,

    /// Seconds to wait for the agent's ready confirmation
    #[arg(long, env = "TUNNEL_READY_TIMEOUT_SECS", default_value_t = 15)]
    ready_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Starting fbtunnel server...");

    if args.insecure {
        warn!("Control channel running in insecure mode (no TLS)");
    }

    let config = ServerConfig {
        public_addr: listen_addr(&args.external_port),
        control_addr: listen_addr(&args.grpc_port),
        auth_token: args.auth_token,
        cert_path: args.server_cert,
        key_path: args.server_key,
        insecure: args.insecure,
        max_tunnels: args.max_tunnels,
        ready_timeout: Duration::from_secs(args.ready_timeout_secs),
    };

    let server = TunnelServer::bind(config)
        .await
        .context("Failed to start tunnel server")?;

    info!("Control listener on {}", server.control_addr()?);
    info!("Public listener on {}", server.public_addr()?);

    let root = CancellationToken::new();
    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    server.serve(root).await;

    info!("Server stopped");
    Ok(())
}
