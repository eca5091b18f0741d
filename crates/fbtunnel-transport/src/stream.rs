//! Framed stream and its split halves

use crate::{TransportError, TransportResult};
use bytes::BytesMut;
use fbtunnel_proto::{Frame, FrameCodec, Handshake};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Byte stream the control channel can run over
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Read one length-prefixed message, buffering partial reads
///
/// Returns `None` on clean EOF at a message boundary.
async fn read_one<T, R>(reader: &mut R, buf: &mut BytesMut) -> TransportResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = FrameCodec::decode::<T>(buf)? {
            return Ok(Some(msg));
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::Protocol(
                "connection closed mid-message".to_string(),
            ));
        }
    }
}

/// A whole control connection, used during the handshake
pub struct FrameStream {
    io: Box<dyn Io>,
    recv_buf: BytesMut,
}

impl FrameStream {
    pub fn new(io: impl Io + 'static) -> Self {
        Self {
            io: Box::new(io),
            recv_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Send a handshake message
    pub async fn send_handshake(&mut self, msg: &Handshake) -> TransportResult<()> {
        let encoded = FrameCodec::encode(msg)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Receive a handshake message; `None` on clean EOF
    pub async fn recv_handshake(&mut self) -> TransportResult<Option<Handshake>> {
        read_one(&mut self.io, &mut self.recv_buf).await
    }

    /// Split into a receive half and a send half
    ///
    /// Bytes already buffered (e.g. a frame that arrived on the heels of
    /// the handshake) carry over into the receiver.
    pub fn into_split(self) -> (FrameReceiver, FrameSender) {
        let (reader, writer) = tokio::io::split(self.io);
        (
            FrameReceiver {
                reader,
                recv_buf: self.recv_buf,
            },
            FrameSender { writer },
        )
    }
}

/// Receive half of the control stream; owned by the single receive task
pub struct FrameReceiver {
    reader: ReadHalf<Box<dyn Io>>,
    recv_buf: BytesMut,
}

impl FrameReceiver {
    /// Receive the next frame; `None` on clean EOF
    pub async fn recv(&mut self) -> TransportResult<Option<Frame>> {
        read_one(&mut self.reader, &mut self.recv_buf).await
    }
}

/// Send half of the control stream
///
/// The underlying stream is single-writer; callers serialize access through
/// a session mutex.
pub struct FrameSender {
    writer: WriteHalf<Box<dyn Io>>,
}

impl FrameSender {
    /// Send one frame
    pub async fn send(&mut self, frame: &Frame) -> TransportResult<()> {
        let encoded = FrameCodec::encode(frame)?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
