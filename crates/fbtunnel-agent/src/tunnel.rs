//! Per-tunnel task: dial the backend, confirm readiness, pump bytes up

use crate::agent::Agent;
use crate::registry::{LocalCloseReason, LocalTunnel};
use fbtunnel_proto::{Frame, READ_BUFFER_SIZE};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backend dial timeout
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one `START_DATA_TUNNEL` request end to end
pub(crate) async fn run_tunnel(agent: Agent, id: String) {
    let cancel = agent.root().child_token();

    debug!(tunnel_id = %id, backend = %agent.config().backend_addr, "Connecting to local Firebird");

    let backend = tokio::select! {
        _ = cancel.cancelled() => {
            agent.untrack_task(&id);
            return;
        }
        result = timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(&agent.config().backend_addr)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    report_dial_failure(&agent, &id, &e.to_string()).await;
                    agent.untrack_task(&id);
                    return;
                }
                Err(_) => {
                    report_dial_failure(&agent, &id, "connect timeout").await;
                    agent.untrack_task(&id);
                    return;
                }
            }
        }
    };

    debug!(tunnel_id = %id, "Connected to local Firebird");

    let (mut backend_read, backend_write) = backend.into_split();
    let tunnel = LocalTunnel::new(id.clone(), backend_write, cancel.clone());

    // Registering after the dial means an agent teardown that raced us must
    // be observed here; the server already knows the stream is gone, so the
    // fresh socket is simply dropped.
    let inserted = agent
        .registry()
        .insert_when(tunnel, || agent.link_up() && !agent.root().is_cancelled());
    if !inserted {
        debug!(tunnel_id = %id, "Agent disconnected before tunnel ready, aborting");
        agent.untrack_task(&id);
        return;
    }

    if agent.send_to_server(&Frame::ready(id.as_str())).await.is_err() {
        // The server observes the send failure on its side; tear down quietly
        agent
            .close_local_tunnel(&id, LocalCloseReason::SendFailed)
            .await;
        agent.untrack_task(&id);
        return;
    }

    debug!(tunnel_id = %id, "Tunnel ready, pumping backend data");

    let reason = pump_backend(&agent, &id, &mut backend_read, &cancel).await;
    agent.close_local_tunnel(&id, reason).await;

    debug!(tunnel_id = %id, "Finished handling tunnel");
    agent.untrack_task(&id);
}

/// Report a failed backend dial: `ERROR` first, then `CLOSE_TUNNEL`
async fn report_dial_failure(agent: &Agent, id: &str, error: &str) {
    let message = format!("Failed to connect to local Firebird: {}", error);
    warn!(tunnel_id = %id, "{}", message);

    let _ = agent.send_to_server(&Frame::error(id, message.as_str())).await;
    let _ = agent.send_to_server(&Frame::close(id, message.as_str())).await;
}

/// Read backend bytes and forward them as `DATA` frames
async fn pump_backend(
    agent: &Agent,
    id: &str,
    backend_read: &mut OwnedReadHalf,
    cancel: &CancellationToken,
) -> LocalCloseReason {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Whoever cancelled already removed the record; the close
                // below becomes a no-op.
                return LocalCloseReason::LinkLost;
            }
            result = backend_read.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(tunnel_id = %id, "Local Firebird connection closed (EOF)");
                    return LocalCloseReason::BackendEof;
                }
                Ok(n) => {
                    if agent
                        .send_to_server(&Frame::data(id, buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        return LocalCloseReason::SendFailed;
                    }
                }
                Err(e) => {
                    warn!(tunnel_id = %id, error = %e, "Error reading from local Firebird");
                    return LocalCloseReason::BackendRead(e.to_string());
                }
            }
        }
    }
}
