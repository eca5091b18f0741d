//! Frame type and helper constructors

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame type codes
///
/// The raw `u8` stays on the [`Frame`] so that codes introduced by a newer
/// peer decode cleanly and can be logged and dropped at dispatch instead of
/// poisoning the whole control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    StartDataTunnel = 0,
    TunnelReady = 1,
    Data = 2,
    CloseTunnel = 3,
    Error = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(FrameType::StartDataTunnel),
            1 => Ok(FrameType::TunnelReady),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::CloseTunnel),
            4 => Ok(FrameType::Error),
            other => Err(other),
        }
    }
}

/// A single message on the control stream
///
/// `close_reason` and `error_message` are the typed fields; the same values
/// are mirrored into `metadata["reason"]` / `metadata["error"]` for older
/// peers. Readers prefer the typed field and fall back to metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Raw frame type code; see [`Frame::kind`]
    pub frame_type: u8,

    /// Tunnel identifier (UUIDv4 allocated by the server)
    pub connection_id: String,

    /// Raw bytes, only meaningful for `DATA`
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub close_reason: Option<String>,

    pub error_message: Option<String>,

    /// Seconds since epoch, advisory only
    pub timestamp: Option<i64>,

    /// Legacy string map kept for backward compatibility
    pub metadata: HashMap<String, String>,
}

impl Frame {
    fn new(frame_type: FrameType, connection_id: impl Into<String>) -> Self {
        Self {
            frame_type: frame_type as u8,
            connection_id: connection_id.into(),
            payload: Vec::new(),
            close_reason: None,
            error_message: None,
            timestamp: Some(unix_now()),
            metadata: HashMap::new(),
        }
    }

    /// Create a `START_DATA_TUNNEL` frame
    pub fn start(connection_id: impl Into<String>) -> Self {
        Self::new(FrameType::StartDataTunnel, connection_id)
    }

    /// Create a `TUNNEL_READY` frame
    pub fn ready(connection_id: impl Into<String>) -> Self {
        Self::new(FrameType::TunnelReady, connection_id)
    }

    /// Create a `DATA` frame
    pub fn data(connection_id: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut frame = Self::new(FrameType::Data, connection_id);
        frame.payload = payload;
        frame
    }

    /// Create a `CLOSE_TUNNEL` frame
    pub fn close(connection_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameType::CloseTunnel, connection_id);
        frame.set_close_reason(reason.into());
        frame
    }

    /// Create an `ERROR` frame
    pub fn error(connection_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameType::Error, connection_id);
        frame.set_error_message(message.into());
        frame
    }

    /// Resolve the raw type code; `None` for codes from a newer peer
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::try_from(self.frame_type).ok()
    }

    /// Set the close reason, mirroring into metadata for older peers
    pub fn set_close_reason(&mut self, reason: String) {
        self.metadata.insert("reason".to_string(), reason.clone());
        self.close_reason = Some(reason);
    }

    /// Set the error message, mirroring into metadata for older peers
    pub fn set_error_message(&mut self, message: String) {
        self.metadata.insert("error".to_string(), message.clone());
        self.error_message = Some(message);
    }

    /// Close reason: typed field, else `metadata["reason"]`, else empty
    pub fn close_reason(&self) -> &str {
        if let Some(reason) = &self.close_reason {
            return reason;
        }
        self.metadata.get("reason").map(String::as_str).unwrap_or("")
    }

    /// Error message: typed field, else `metadata["error"]`, else empty
    pub fn error_message(&self) -> &str {
        if let Some(message) = &self.error_message {
            return message;
        }
        self.metadata.get("error").map(String::as_str).unwrap_or("")
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_sets_typed_and_metadata() {
        let frame = Frame::close("tunnel-1", "Timeout waiting for ready");

        assert_eq!(frame.kind(), Some(FrameType::CloseTunnel));
        assert_eq!(frame.close_reason.as_deref(), Some("Timeout waiting for ready"));
        assert_eq!(
            frame.metadata.get("reason").map(String::as_str),
            Some("Timeout waiting for ready")
        );
        assert!(frame.timestamp.is_some());
    }

    #[test]
    fn test_error_frame_sets_typed_and_metadata() {
        let frame = Frame::error("tunnel-1", "Failed to connect to local Firebird: refused");

        assert_eq!(frame.kind(), Some(FrameType::Error));
        assert_eq!(frame.error_message(), "Failed to connect to local Firebird: refused");
        assert_eq!(
            frame.metadata.get("error").map(String::as_str),
            Some("Failed to connect to local Firebird: refused")
        );
    }

    #[test]
    fn test_close_reason_falls_back_to_metadata() {
        let mut frame = Frame::data("tunnel-1", vec![]);
        frame.frame_type = FrameType::CloseTunnel as u8;
        frame
            .metadata
            .insert("reason".to_string(), "legacy reason".to_string());

        assert!(frame.close_reason.is_none());
        assert_eq!(frame.close_reason(), "legacy reason");
    }

    #[test]
    fn test_typed_field_wins_over_metadata() {
        let mut frame = Frame::close("tunnel-1", "typed");
        frame
            .metadata
            .insert("reason".to_string(), "stale".to_string());

        assert_eq!(frame.close_reason(), "typed");
    }

    #[test]
    fn test_missing_reason_is_empty() {
        let frame = Frame::ready("tunnel-1");
        assert_eq!(frame.close_reason(), "");
        assert_eq!(frame.error_message(), "");
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut frame = Frame::ready("tunnel-1");
        frame.frame_type = 42;
        assert_eq!(frame.kind(), None);
    }

    #[test]
    fn test_data_frame_payload() {
        let frame = Frame::data("tunnel-1", b"ping\n".to_vec());
        assert_eq!(frame.kind(), Some(FrameType::Data));
        assert_eq!(frame.payload, b"ping\n");
    }
}
