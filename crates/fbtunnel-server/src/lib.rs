//! Tunnel server
//!
//! Owns the single authenticated agent control stream, accepts raw TCP
//! clients on the public listener, and bridges each client to the backend
//! through the agent. One tunnel per client, identified by a server-assigned
//! UUIDv4, tracked in a registry whose remove-first close discipline keeps
//! teardown idempotent under races.

pub mod config;
pub mod listener;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{listen_addr, ServerConfig};
pub use registry::{CloseReason, InsertError, Tunnel, TunnelRegistry};
pub use server::{ServerHandle, TunnelServer};
pub use session::AgentSession;

use fbtunnel_transport::TransportError;
use thiserror::Error;

/// Server-side errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Agent stream is not available")]
    AgentUnavailable,
}
