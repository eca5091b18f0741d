//! Framed control stream over TCP or TLS
//!
//! The tunnel core treats the control channel as an ordered, reliable
//! message stream. This crate provides that abstraction: [`FrameStream`]
//! wraps any byte stream (plain TCP or rustls TLS) with the length-prefixed
//! codec from `fbtunnel-proto`, and splits into an independently owned
//! [`FrameSender`] and [`FrameReceiver`] so that one task can receive while
//! another serializes sends.

pub mod stream;
pub mod tls;

pub use stream::{FrameReceiver, FrameSender, FrameStream};
pub use tls::{client_connector, server_acceptor};

use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] fbtunnel_proto::CodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
