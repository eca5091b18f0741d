//! Control-channel handshake
//!
//! Exchanged once per control connection, before any frames. The agent
//! sends `Hello` with its authorization token; the server answers `Accept`
//! or `Reject` and, on rejection, closes the connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    /// Agent -> server: `<token>` or `Bearer <token>`
    Hello { authorization: String },

    /// Server -> agent: control stream is live
    Accept,

    /// Server -> agent: connection refused; the stream closes after this
    Reject { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use bytes::BytesMut;

    #[test]
    fn test_handshake_roundtrip() {
        let hello = Handshake::Hello {
            authorization: "Bearer secret".to_string(),
        };

        let encoded = FrameCodec::encode(&hello).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded: Option<Handshake> = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(hello));
    }

    #[test]
    fn test_reject_roundtrip() {
        let reject = Handshake::Reject {
            reason: "agent already connected".to_string(),
        };

        let encoded = FrameCodec::encode(&reject).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded: Option<Handshake> = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(reject));
    }
}
