//! fbtunnel agent binary
//!
//! Runs next to the private backend, dials the tunnel server, and forwards
//! each requested tunnel to the local Firebird address.

use anyhow::{Context, Result};
use clap::Parser;
use fbtunnel_agent::{Agent, AgentConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// fbtunnel agent - forwards tunnel traffic to the local backend
#[derive(Parser, Debug)]
#[command(name = "fbtunnel-agent")]
#[command(about = "fbtunnel agent - forwards tunnel traffic to the local backend")]
#[command(version)]
#[command(long_about = r#"
The fbtunnel agent connects out to a tunnel server and forwards incoming
tunnels to the local Firebird address. Only the agent dials out, so the
backend can sit behind NAT or a firewall.

ENVIRONMENT VARIABLES:
  TUNNEL_SERVER_ADDR     Server control endpoint (host:port)
  FIREBIRD_LOCAL_ADDR    Backend to dial per tunnel (host:port)
  TUNNEL_AUTH_TOKEN      Shared secret
  TUNNEL_CA_CERT         Optional CA bundle for server verification
  TUNNEL_INSECURE        "true" disables TLS (never in production)
  DANGEROUS_SKIP_VERIFY  "true" skips server-certificate verification
"#)]
struct Args {
    /// Tunnel server control endpoint (host:port)
    #[arg(long, env = "TUNNEL_SERVER_ADDR")]
    server_addr: String,

    /// Local Firebird address to dial per tunnel (host:port)
    #[arg(long, env = "FIREBIRD_LOCAL_ADDR")]
    firebird_addr: String,

    /// Shared secret for server authentication
    #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
    auth_token: String,

    /// CA bundle (PEM) for server verification
    #[arg(long, env = "TUNNEL_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Dial the server over plain TCP (never in production)
    #[arg(long, env = "TUNNEL_INSECURE")]
    insecure: bool,

    /// Skip server-certificate verification (dangerous, debugging only)
    #[arg(long = "dangerous-skip-verify", env = "DANGEROUS_SKIP_VERIFY")]
    skip_verify: bool,

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

    info!("Starting fbtunnel agent...");

    if args.insecure {
        warn!("Running in insecure mode (TLS disabled)");
    }
    if args.skip_verify {
        warn!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
        warn!("!!! WARNING: Skipping TLS server verification    !!!");
        warn!("!!!          USE ONLY FOR TEMPORARY DEBUGGING    !!!");
        warn!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
    }
    if !args.insecure && args.ca_cert.is_none() {
        info!("No custom CA certificate provided, using system roots");
    }

    let config = AgentConfig {
        server_addr: args.server_addr,
        backend_addr: args.firebird_addr,
        auth_token: args.auth_token,
        ca_cert: args.ca_cert,
        insecure: args.insecure,
        skip_verify: args.skip_verify,
    };

    info!(server = %config.server_addr, backend = %config.backend_addr, "Agent configured");

    let root = CancellationToken::new();
    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    let agent = Agent::new(config, root).context("Failed to create agent")?;
    agent.run().await;

    info!("Agent shut down");
    Ok(())
}
