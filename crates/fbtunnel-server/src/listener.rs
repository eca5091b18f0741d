//! Public TCP listener and per-client handler
//!
//! Each accepted client becomes one tunnel: allocate an id, register,
//! ask the agent to open its side, wait for the ready confirmation, then
//! pump client bytes to the agent. Backend-to-client bytes arrive through
//! the frame dispatcher, not here.

use crate::registry::{CloseReason, InsertError, Tunnel};
use crate::session::AgentSession;
use fbtunnel_proto::{Frame, READ_BUFFER_SIZE};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accept remote clients until the root token fires
pub async fn run_public_listener(
    session: AgentSession,
    listener: TcpListener,
    ready_timeout: Duration,
    max_tunnels: Option<usize>,
    root: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = root.cancelled() => {
                info!("Public listener stopping");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted client connection");
                    let session = session.clone();
                    let root = root.clone();
                    tokio::spawn(async move {
                        handle_client(session, stream, ready_timeout, max_tunnels, root).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept client connection");
                }
            }
        }
    }
}

async fn handle_client(
    session: AgentSession,
    stream: TcpStream,
    ready_timeout: Duration,
    max_tunnels: Option<usize>,
    root: CancellationToken,
) {
    // No agent, no tunnel. Dropping the stream closes the socket.
    if !session.is_connected() {
        debug!("No agent connected, dropping client");
        return;
    }

    let id = Uuid::new_v4().to_string();
    info!(tunnel_id = %id, "Handling new client connection");

    let (mut client_read, client_write) = stream.into_split();
    let cancel = root.child_token();
    let (tunnel, ready_rx) = Tunnel::new(id.clone(), client_write, cancel.clone());

    match session.register_tunnel(tunnel, max_tunnels) {
        Ok(()) => {}
        Err(InsertError::AgentNotConnected) => {
            debug!(tunnel_id = %id, "Agent dropped while accepting client");
            return;
        }
        Err(InsertError::CapacityReached) => {
            warn!(tunnel_id = %id, "Tunnel capacity reached, dropping client");
            return;
        }
    }

    // Fetched after registration so the token belongs to the session the
    // tunnel was registered under
    let Some(session_token) = session.session_token() else {
        session.close_tunnel(&id, CloseReason::AgentGone).await;
        return;
    };

    let reason = drive_client(
        &session,
        &id,
        &mut client_read,
        ready_rx,
        cancel,
        session_token,
        ready_timeout,
    )
    .await;

    session.close_tunnel(&id, reason).await;
}

/// Run the handshake wait and the client-to-agent pump
///
/// Returns the close reason; the caller performs the (idempotent) close.
async fn drive_client(
    session: &AgentSession,
    id: &str,
    client_read: &mut OwnedReadHalf,
    ready_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
    session_token: CancellationToken,
    ready_timeout: Duration,
) -> CloseReason {
    if session.send_to_agent(&Frame::start(id)).await.is_err() {
        return CloseReason::SendToAgentFailed;
    }

    debug!(tunnel_id = %id, "Waiting for TUNNEL_READY");
    tokio::select! {
        result = ready_rx => {
            if result.is_err() {
                // Sender dropped without firing: the tunnel was closed under us
                return CloseReason::HandlerExit;
            }
        }
        _ = tokio::time::sleep(ready_timeout) => {
            warn!(tunnel_id = %id, "Timeout waiting for TUNNEL_READY");
            return CloseReason::ReadyTimeout;
        }
        _ = cancel.cancelled() => {
            return CloseReason::HandlerExit;
        }
        _ = session_token.cancelled() => {
            return CloseReason::AgentGone;
        }
    }

    debug!(tunnel_id = %id, "Tunnel ready, pumping client data");
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return CloseReason::HandlerExit,
            result = client_read.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(tunnel_id = %id, "Client closed connection");
                    return CloseReason::ClientEof;
                }
                Ok(n) => {
                    if session
                        .send_to_agent(&Frame::data(id, buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        return CloseReason::SendDataFailed;
                    }
                }
                Err(e) => {
                    debug!(tunnel_id = %id, error = %e, "Client read error");
                    return CloseReason::ClientEof;
                }
            }
        }
    }
}
