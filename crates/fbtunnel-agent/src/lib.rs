//! Tunnel agent
//!
//! Runs inside the private network next to the backend. Maintains a single
//! outbound control stream to the tunnel server, reconnecting with capped
//! exponential backoff, and opens one local backend connection per
//! `START_DATA_TUNNEL` request, pumping backend bytes up as `DATA` frames.

pub mod agent;
pub mod backoff;
pub mod registry;
mod tunnel;

pub use agent::{Agent, AgentConfig};
pub use backoff::{ReconnectBackoff, ReconnectConfig};
pub use registry::{LocalCloseReason, LocalRegistry, LocalTunnel};

use fbtunnel_transport::TransportError;
use thiserror::Error;

/// Agent-side errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Control stream is not available")]
    ControlStreamUnavailable,
}
