//! Local tunnel records and the agent-side registry

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a local tunnel is being closed
///
/// Server-initiated closes and link loss are not echoed back; everything
/// the agent notices locally is.
#[derive(Debug)]
pub enum LocalCloseReason {
    /// Server sent `CLOSE_TUNNEL`
    ClosedByServer,
    /// Control stream lost or agent shutting down
    LinkLost,
    /// Backend closed the connection
    BackendEof,
    /// Backend read failed
    BackendRead(String),
    /// Writing client data to the backend failed
    BackendWrite(String),
    /// A control-stream send failed; the server will notice on its own
    SendFailed,
}

impl LocalCloseReason {
    /// Whether the server should receive a `CLOSE_TUNNEL` for this close
    pub fn notify_server(&self) -> bool {
        !matches!(
            self,
            LocalCloseReason::ClosedByServer
                | LocalCloseReason::LinkLost
                | LocalCloseReason::SendFailed
        )
    }
}

impl fmt::Display for LocalCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalCloseReason::ClosedByServer => write!(f, "Closed by server"),
            LocalCloseReason::LinkLost => write!(f, "Agent disconnecting or connection lost"),
            LocalCloseReason::BackendEof => write!(f, "Read error/EOF from local Firebird"),
            LocalCloseReason::BackendRead(msg) => {
                write!(f, "Read error from local Firebird: {}", msg)
            }
            LocalCloseReason::BackendWrite(msg) => {
                write!(f, "Write error to local Firebird: {}", msg)
            }
            LocalCloseReason::SendFailed => write!(f, "Failed to send to server"),
        }
    }
}

/// One live backend connection, owned by its pump task
pub struct LocalTunnel {
    pub id: String,
    backend_write: Mutex<OwnedWriteHalf>,
    pub cancel: CancellationToken,
}

impl LocalTunnel {
    pub fn new(id: String, backend_write: OwnedWriteHalf, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id,
            backend_write: Mutex::new(backend_write),
            cancel,
        })
    }

    /// Write client bytes to the backend
    pub async fn write_backend(&self, data: &[u8]) -> std::io::Result<()> {
        self.backend_write.lock().await.write_all(data).await
    }

    /// Shut down the backend write-half
    pub async fn shutdown_backend(&self) {
        let _ = self.backend_write.lock().await.shutdown().await;
    }
}

/// Map of live local tunnels keyed by connection id
pub struct LocalRegistry {
    tunnels: StdMutex<HashMap<String, Arc<LocalTunnel>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: StdMutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalTunnel>>> {
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a tunnel if `check` still holds under the lock
    ///
    /// The per-tunnel task runs the control-stream-present and
    /// not-cancelled checks here, after the backend dial completed, so an
    /// agent teardown that raced the dial is observed before registration.
    pub fn insert_when(&self, tunnel: Arc<LocalTunnel>, check: impl FnOnce() -> bool) -> bool {
        let mut map = self.lock();
        if !check() {
            return false;
        }
        map.insert(tunnel.id.clone(), tunnel);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<LocalTunnel>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<LocalTunnel>> {
        self.lock().remove(id)
    }

    /// Snapshot of live tunnel ids (cleanup path iterates over these)
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}
