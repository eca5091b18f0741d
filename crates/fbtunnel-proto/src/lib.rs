//! Wire protocol for the fbtunnel control channel
//!
//! A single bidirectional stream between server and agent carries
//! length-prefixed [`Frame`] messages. Five frame types drive the tunnel
//! lifecycle: `START_DATA_TUNNEL`, `TUNNEL_READY`, `DATA`, `CLOSE_TUNNEL`
//! and `ERROR`. A short [`Handshake`] exchange authenticates the agent
//! before any frames flow.

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{CodecError, FrameCodec};
pub use frame::{Frame, FrameType};
pub use handshake::Handshake;

/// Read buffer size for tunnel byte pumps (both sides)
pub const READ_BUFFER_SIZE: usize = 32 * 1024;
