//! Codec for control-channel messages
//!
//! Format: `[length: u32 big-endian][payload: bincode]`. The same framing
//! carries both [`Frame`](crate::Frame) traffic and the one-shot
//! [`Handshake`](crate::Handshake) exchange.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Length-prefixed bincode codec
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a message to bytes
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from the buffer
    ///
    /// Returns `Ok(Some(message))` if a complete message was decoded,
    /// `Ok(None)` if more data is needed.
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: T = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}
