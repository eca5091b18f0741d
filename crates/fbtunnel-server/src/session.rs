//! Agent session management
//!
//! At most one agent owns the control stream at a time. The session mutex
//! serializes every outbound frame; the receive loop is the only reader.
//! On any exit from the control handler the session is cleared first, then
//! every live tunnel is drained, cancelled and closed, without sending
//! `CLOSE_TUNNEL` to the agent (the stream is gone).

use crate::registry::{CloseReason, InsertError, Tunnel, TunnelRegistry};
use crate::ServerError;
use fbtunnel_proto::{Frame, FrameType, Handshake};
use fbtunnel_transport::{FrameSender, FrameStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a connecting agent gets to complete the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The (at most one) agent control stream plus the tunnel registry
///
/// Cheap to clone; clones share the same session state.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    auth_token: String,
    registry: Arc<TunnelRegistry>,
    /// Serialized send path onto the control stream
    sender: Mutex<Option<FrameSender>>,
    /// Mirrors sender presence for lock-free checks under the registry lock
    connected: AtomicBool,
    /// Cancelled when the current control stream goes away
    session_token: StdMutex<Option<CancellationToken>>,
}

impl AgentSession {
    pub fn new(auth_token: String, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                auth_token,
                registry,
                sender: Mutex::new(None),
                connected: AtomicBool::new(false),
                session_token: StdMutex::new(None),
            }),
        }
    }

    /// Whether an agent control stream is currently installed
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Cancellation token of the current session, if any
    pub fn session_token(&self) -> Option<CancellationToken> {
        match self.inner.session_token.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of live tunnels
    pub fn active_tunnels(&self) -> usize {
        self.inner.registry.len()
    }

    /// Register a tunnel, re-checking agent presence under the registry lock
    pub fn register_tunnel(
        &self,
        tunnel: Arc<Tunnel>,
        cap: Option<usize>,
    ) -> Result<(), InsertError> {
        let session = self.clone();
        self.inner
            .registry
            .insert_guarded(tunnel, move || session.is_connected(), cap)
    }

    /// Accept agent connections until the root token fires
    pub async fn run_control_listener(
        self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        root: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = root.cancelled() => {
                    info!("Control listener stopping");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "Agent attempting to connect");
                        let session = self.clone();
                        let tls = tls.clone();
                        let root = root.clone();
                        tokio::spawn(async move {
                            session.handle_control_conn(stream, tls, root).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                    }
                }
            }
        }
    }

    async fn handle_control_conn(
        self,
        stream: TcpStream,
        tls: Option<TlsAcceptor>,
        root: CancellationToken,
    ) {
        let mut frame_stream = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => FrameStream::new(tls_stream),
                Err(e) => {
                    warn!(error = %e, "TLS handshake with agent failed");
                    return;
                }
            },
            None => FrameStream::new(stream),
        };

        let authorization = match timeout(HANDSHAKE_TIMEOUT, frame_stream.recv_handshake()).await {
            Ok(Ok(Some(Handshake::Hello { authorization }))) => authorization,
            Ok(Ok(Some(other))) => {
                warn!(message = ?other, "Unexpected handshake message from agent");
                return;
            }
            Ok(Ok(None)) => {
                debug!("Agent closed before completing handshake");
                return;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Handshake receive failed");
                return;
            }
            Err(_) => {
                warn!("Agent handshake timed out");
                return;
            }
        };

        if !verify_token(&authorization, &self.inner.auth_token) {
            warn!("Authentication failed: invalid token received");
            let _ = frame_stream
                .send_handshake(&Handshake::Reject {
                    reason: "unauthenticated: invalid token".to_string(),
                })
                .await;
            return;
        }

        let session_token = root.child_token();
        let mut receiver = {
            let mut sender_slot = self.inner.sender.lock().await;
            if sender_slot.is_some() {
                drop(sender_slot);
                warn!("Agent connection rejected: another agent is already connected");
                let _ = frame_stream
                    .send_handshake(&Handshake::Reject {
                        reason: "agent already connected".to_string(),
                    })
                    .await;
                return;
            }
            if let Err(e) = frame_stream.send_handshake(&Handshake::Accept).await {
                warn!(error = %e, "Failed to confirm agent handshake");
                return;
            }
            let (receiver, sender) = frame_stream.into_split();
            *sender_slot = Some(sender);
            match self.inner.session_token.lock() {
                Ok(mut slot) => *slot = Some(session_token.clone()),
                Err(poisoned) => *poisoned.into_inner() = Some(session_token.clone()),
            }
            self.inner.connected.store(true, Ordering::SeqCst);
            receiver
        };

        info!("Agent control stream established");

        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                result = receiver.recv() => match result {
                    Ok(Some(frame)) => self.dispatch(frame).await,
                    Ok(None) => {
                        info!("Agent stream closed by agent (EOF)");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Error receiving frame from agent");
                        break;
                    }
                }
            }
        }

        self.teardown_session(&session_token).await;
    }

    /// Clear the session, then drain and close every live tunnel
    async fn teardown_session(&self, session_token: &CancellationToken) {
        // Presence goes first so racing client handlers stop registering
        self.inner.connected.store(false, Ordering::SeqCst);
        match self.inner.session_token.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        session_token.cancel();
        *self.inner.sender.lock().await = None;

        let tunnels = self.inner.registry.drain();
        info!(count = tunnels.len(), "Agent control stream closed");
        for tunnel in tunnels {
            info!(tunnel_id = %tunnel.id, "Closing tunnel due to agent disconnect");
            tunnel.cancel.cancel();
            tunnel.shutdown_client().await;
        }
    }

    /// Send a frame to the agent, serialized through the session mutex
    ///
    /// A failed send for a frame that names a tunnel schedules that tunnel's
    /// close on a separate task; running it inline would re-enter the
    /// session lock from the close path.
    pub async fn send_to_agent(&self, frame: &Frame) -> Result<(), ServerError> {
        let mut sender_slot = self.inner.sender.lock().await;
        let sender = sender_slot.as_mut().ok_or(ServerError::AgentUnavailable)?;

        if let Err(e) = sender.send(frame).await {
            warn!(
                frame_type = frame.frame_type,
                tunnel_id = %frame.connection_id,
                error = %e,
                "Error sending frame to agent"
            );
            if !frame.connection_id.is_empty() {
                let session = self.clone();
                let id = frame.connection_id.clone();
                tokio::spawn(async move {
                    session
                        .close_tunnel(&id, CloseReason::SendToAgentFailed)
                        .await;
                });
            }
            return Err(ServerError::Transport(e));
        }
        Ok(())
    }

    /// Close one tunnel: remove, cancel, close socket, maybe notify agent
    ///
    /// Idempotent: a second caller finds the id absent and returns.
    pub fn close_tunnel<'a>(
        &'a self,
        id: &'a str,
        reason: CloseReason,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(tunnel) = self.inner.registry.remove(id) else {
                return;
            };

            info!(tunnel_id = %id, reason = %reason, "Closing tunnel");

            tunnel.cancel.cancel();
            tunnel.shutdown_client().await;

            if reason.notify_agent() {
                if let Err(e) = self
                    .send_to_agent(&Frame::close(id, reason.to_string()))
                    .await
                {
                    debug!(tunnel_id = %id, error = %e, "Failed to send CLOSE_TUNNEL notification");
                }
            }
        })
    }

    /// Handle one frame received from the agent
    async fn dispatch(&self, frame: Frame) {
        let Some(kind) = frame.kind() else {
            debug!(
                frame_type = frame.frame_type,
                tunnel_id = %frame.connection_id,
                "Dropping frame with unknown type"
            );
            return;
        };

        match kind {
            FrameType::TunnelReady => match self.inner.registry.get(&frame.connection_id) {
                Some(tunnel) => {
                    if tunnel.signal_ready() {
                        debug!(tunnel_id = %frame.connection_id, "Tunnel ready signal received");
                    } else {
                        debug!(tunnel_id = %frame.connection_id, "Duplicate ready signal ignored");
                    }
                }
                None => {
                    debug!(tunnel_id = %frame.connection_id, "READY for unknown tunnel");
                }
            },
            FrameType::Data => {
                let Some(tunnel) = self.inner.registry.get(&frame.connection_id) else {
                    debug!(tunnel_id = %frame.connection_id, "DATA for unknown tunnel, dropping");
                    return;
                };
                if let Err(e) = tunnel.write_client(&frame.payload).await {
                    warn!(tunnel_id = %frame.connection_id, error = %e, "Error writing to remote client");
                    self.close_tunnel(&frame.connection_id, CloseReason::ClientWrite)
                        .await;
                }
            }
            FrameType::CloseTunnel => {
                info!(
                    tunnel_id = %frame.connection_id,
                    reason = %frame.close_reason(),
                    "Received CLOSE_TUNNEL from agent"
                );
                self.close_tunnel(&frame.connection_id, CloseReason::ClosedByAgent)
                    .await;
            }
            FrameType::Error => {
                warn!(
                    tunnel_id = %frame.connection_id,
                    error = %frame.error_message(),
                    "Received ERROR from agent"
                );
                let reason = CloseReason::AgentReported(frame.error_message().to_string());
                self.close_tunnel(&frame.connection_id, reason).await;
            }
            FrameType::StartDataTunnel => {
                debug!(tunnel_id = %frame.connection_id, "Unexpected START from agent, dropping");
            }
        }
    }
}

/// Constant-time token check; accepts `<token>` or `Bearer <token>`
fn verify_token(received: &str, expected: &str) -> bool {
    let token = received.strip_prefix("Bearer ").unwrap_or(received);
    token.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_token_bare() {
        assert!(verify_token("secret", "secret"));
    }

    #[test]
    fn test_verify_token_bearer() {
        assert!(verify_token("Bearer secret", "secret"));
    }

    #[test]
    fn test_verify_token_rejects_wrong() {
        assert!(!verify_token("wrong", "secret"));
        assert!(!verify_token("Bearer wrong", "secret"));
        assert!(!verify_token("", "secret"));
    }

    #[test]
    fn test_verify_token_rejects_prefix_only() {
        assert!(!verify_token("secr", "secret"));
        assert!(!verify_token("secrets", "secret"));
    }

    #[tokio::test]
    async fn test_session_starts_disconnected() {
        let registry = Arc::new(TunnelRegistry::new());
        let session = AgentSession::new("secret".to_string(), registry);

        assert!(!session.is_connected());
        assert!(session.session_token().is_none());
        assert_eq!(session.active_tunnels(), 0);
    }
}
