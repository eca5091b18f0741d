//! Tunnel records and the server-side registry
//!
//! The registry is the only shared index of live tunnels. Critical sections
//! are map operations only; sockets are closed and frames sent after the
//! lock is released. Close is remove-then-act, so two racing closers cannot
//! both free the same tunnel and a late `DATA` frame observes the id as
//! absent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Why a tunnel is being closed
///
/// The variant decides whether the agent is notified: closes that the agent
/// initiated (or that mean the control stream itself is broken) must not
/// echo a `CLOSE_TUNNEL` back.
#[derive(Debug)]
pub enum CloseReason {
    /// Per-client handler finished without a more specific cause
    HandlerExit,
    /// Remote client closed or the read failed
    ClientEof,
    /// Writing backend data to the remote client failed
    ClientWrite,
    /// Agent never confirmed the backend connection
    ReadyTimeout,
    /// Agent sent `CLOSE_TUNNEL`
    ClosedByAgent,
    /// Agent sent `ERROR`
    AgentReported(String),
    /// A control-stream send failed
    SendToAgentFailed,
    /// Sending a `DATA` frame failed mid-pump
    SendDataFailed,
    /// Control stream dropped while the tunnel was live
    AgentGone,
}

impl CloseReason {
    /// Whether the agent should receive a `CLOSE_TUNNEL` for this close
    pub fn notify_agent(&self) -> bool {
        !matches!(
            self,
            CloseReason::ClosedByAgent
                | CloseReason::AgentReported(_)
                | CloseReason::SendToAgentFailed
                | CloseReason::SendDataFailed
                | CloseReason::AgentGone
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandlerExit => write!(f, "Handler exit"),
            CloseReason::ClientEof => write!(f, "Read error/EOF from remote client"),
            CloseReason::ClientWrite => write!(f, "Error writing to remote client"),
            CloseReason::ReadyTimeout => write!(f, "Timeout waiting for ready"),
            CloseReason::ClosedByAgent => write!(f, "Closed by agent"),
            CloseReason::AgentReported(msg) => write!(f, "Error reported by agent: {}", msg),
            CloseReason::SendToAgentFailed => write!(f, "Failed to send to agent"),
            CloseReason::SendDataFailed => write!(f, "Failed to send data to agent"),
            CloseReason::AgentGone => write!(f, "Agent disconnected"),
        }
    }
}

/// Why a tunnel could not be registered
#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    AgentNotConnected,
    CapacityReached,
}

/// A live tunnel: one remote client bridged to one backend connection
///
/// The handler owns the client read-half; the record holds the write-half
/// (fed by the frame dispatcher) and the one-shot ready signal.
pub struct Tunnel {
    pub id: String,
    client_write: Mutex<OwnedWriteHalf>,
    ready: StdMutex<Option<oneshot::Sender<()>>>,
    pub cancel: CancellationToken,
}

impl Tunnel {
    pub fn new(
        id: String,
        client_write: OwnedWriteHalf,
        cancel: CancellationToken,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let tunnel = Arc::new(Self {
            id,
            client_write: Mutex::new(client_write),
            ready: StdMutex::new(Some(ready_tx)),
            cancel,
        });
        (tunnel, ready_rx)
    }

    /// Fire the ready signal; at most once. Returns false for duplicates.
    pub fn signal_ready(&self) -> bool {
        let sender = match self.ready.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Write backend bytes to the remote client
    pub async fn write_client(&self, data: &[u8]) -> std::io::Result<()> {
        self.client_write.lock().await.write_all(data).await
    }

    /// Shut down the client write-half, releasing the socket
    pub async fn shutdown_client(&self) {
        let _ = self.client_write.lock().await.shutdown().await;
    }
}

/// Map of live tunnels keyed by connection id
pub struct TunnelRegistry {
    tunnels: StdMutex<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: StdMutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Tunnel>>> {
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a tunnel, re-checking agent presence under the lock
    ///
    /// The check runs inside the critical section so a concurrent agent
    /// teardown either sees this tunnel in its drain or makes the check
    /// fail; either way nothing leaks.
    pub fn insert_guarded(
        &self,
        tunnel: Arc<Tunnel>,
        connected: impl FnOnce() -> bool,
        cap: Option<usize>,
    ) -> Result<(), InsertError> {
        let mut map = self.lock();
        if !connected() {
            return Err(InsertError::AgentNotConnected);
        }
        if let Some(cap) = cap {
            if map.len() >= cap {
                return Err(InsertError::CapacityReached);
            }
        }
        map.insert(tunnel.id.clone(), tunnel);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.lock().remove(id)
    }

    /// Remove and return every tunnel (agent teardown path)
    pub fn drain(&self) -> Vec<Arc<Tunnel>> {
        self.lock().drain().map(|(_, tunnel)| tunnel).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
