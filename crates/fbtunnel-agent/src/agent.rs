//! Agent control loop, reconnect handling and frame dispatch

use crate::backoff::{ReconnectBackoff, ReconnectConfig};
use crate::registry::{LocalCloseReason, LocalRegistry};
use crate::tunnel::run_tunnel;
use crate::AgentError;
use fbtunnel_proto::{Frame, FrameType, Handshake};
use fbtunnel_transport::{client_connector, FrameSender, FrameStream, TransportError};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server dial and handshake timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel server control endpoint (host:port)
    pub server_addr: String,

    /// Local backend dialed on every `START_DATA_TUNNEL` (host:port)
    pub backend_addr: String,

    /// Shared secret presented to the server
    pub auth_token: String,

    /// Optional CA bundle for server verification
    pub ca_cert: Option<PathBuf>,

    /// Dial the server over plain TCP (never in production)
    pub insecure: bool,

    /// Skip server-certificate verification (dangerous, debugging only)
    pub skip_verify: bool,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.auth_token.is_empty() {
            return Err(AgentError::Config("auth token is required".to_string()));
        }
        validate_address(&self.server_addr, "server")?;
        validate_address(&self.backend_addr, "backend")?;
        Ok(())
    }
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<(), AgentError> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(AgentError::Config(format!(
            "Invalid {} address format: '{}' (expected host:port)",
            addr_type, addr
        )));
    };
    if host.is_empty() {
        return Err(AgentError::Config(format!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type, addr
        )));
    }
    if port.parse::<u16>().is_err() {
        return Err(AgentError::Config(format!(
            "Invalid port in {} address: {}",
            addr_type, addr
        )));
    }
    Ok(())
}

/// The tunnel agent
///
/// One receive task consumes frames from the server; one task per tunnel
/// pumps backend bytes up. All sends to the server serialize through the
/// sender mutex. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    registry: LocalRegistry,
    sender: Mutex<Option<FrameSender>>,
    /// Mirrors sender presence for checks under the registry lock
    link_up: AtomicBool,
    /// Pump-task handles, awaited during cleanup
    tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    root: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig, root: CancellationToken) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                registry: LocalRegistry::new(),
                sender: Mutex::new(None),
                link_up: AtomicBool::new(false),
                tasks: StdMutex::new(HashMap::new()),
                root,
            }),
        })
    }

    /// Whether the control stream is currently installed
    pub fn link_up(&self) -> bool {
        self.inner.link_up.load(Ordering::SeqCst)
    }

    /// Number of live local tunnels
    pub fn active_tunnels(&self) -> usize {
        self.inner.registry.len()
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub(crate) fn registry(&self) -> &LocalRegistry {
        &self.inner.registry
    }

    pub(crate) fn root(&self) -> &CancellationToken {
        &self.inner.root
    }

    /// Run the control loop until the root token fires
    ///
    /// Reconnects with capped exponential backoff; a clean close resets the
    /// delay to the initial value.
    pub async fn run(self) {
        let mut backoff = ReconnectBackoff::new(ReconnectConfig::default());

        loop {
            if self.inner.root.is_cancelled() {
                info!("Agent cancelled, stopping control loop");
                break;
            }

            match self.connect_and_serve().await {
                Ok(()) => {
                    if self.inner.root.is_cancelled() {
                        break;
                    }
                    info!("Control stream closed cleanly, reconnecting soon");
                    backoff.reset();
                    tokio::select! {
                        _ = self.inner.root.cancelled() => break,
                        _ = sleep(backoff.current_delay()) => {}
                    }
                }
                Err(e) => {
                    if self.inner.root.is_cancelled() {
                        break;
                    }
                    warn!(
                        error = %e,
                        retry_in = ?backoff.current_delay(),
                        "Connection or serve error, reconnecting"
                    );
                    tokio::select! {
                        _ = self.inner.root.cancelled() => break,
                        _ = backoff.wait() => {}
                    }
                }
            }
        }

        info!("Agent control loop stopped");
    }

    /// Dial, authenticate, and run the receive loop until the stream ends
    pub async fn connect_and_serve(&self) -> Result<(), AgentError> {
        info!(server = %self.inner.config.server_addr, "Attempting to connect to server");

        let tcp = tokio::select! {
            _ = self.inner.root.cancelled() => return Ok(()),
            result = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.inner.config.server_addr)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(AgentError::Io(e)),
                    Err(_) => return Err(AgentError::Transport(TransportError::ConnectTimeout)),
                }
            }
        };

        let mut stream = if self.inner.config.insecure {
            FrameStream::new(tcp)
        } else {
            let connector = client_connector(
                self.inner.config.ca_cert.as_deref(),
                self.inner.config.skip_verify,
            )?;
            let host = self
                .inner
                .config
                .server_addr
                .split(':')
                .next()
                .unwrap_or("localhost")
                .to_string();
            let server_name = ServerName::try_from(host)
                .map_err(|e| AgentError::Transport(TransportError::Tls(e.to_string())))?;
            let tls_stream = connector.connect(server_name, tcp).await?;
            FrameStream::new(tls_stream)
        };

        info!("Connected to server");

        stream
            .send_handshake(&Handshake::Hello {
                authorization: format!("Bearer {}", self.inner.config.auth_token),
            })
            .await?;

        match timeout(CONNECT_TIMEOUT, stream.recv_handshake()).await {
            Ok(Ok(Some(Handshake::Accept))) => {}
            Ok(Ok(Some(Handshake::Reject { reason }))) => {
                return Err(AgentError::Rejected(reason));
            }
            Ok(Ok(Some(other))) => {
                return Err(AgentError::Transport(TransportError::Protocol(format!(
                    "unexpected handshake message: {:?}",
                    other
                ))));
            }
            Ok(Ok(None)) => return Err(AgentError::Transport(TransportError::StreamClosed)),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(AgentError::Transport(TransportError::ConnectTimeout)),
        }

        info!("Control stream established with server");

        let (mut receiver, sender) = stream.into_split();
        *self.inner.sender.lock().await = Some(sender);
        self.inner.link_up.store(true, Ordering::SeqCst);

        let result = loop {
            tokio::select! {
                _ = self.inner.root.cancelled() => {
                    info!("Agent cancelled, leaving receive loop");
                    break Ok(());
                }
                result = receiver.recv() => match result {
                    Ok(Some(frame)) => self.dispatch(frame).await,
                    Ok(None) => {
                        info!("Server closed the control stream (EOF)");
                        break Ok(());
                    }
                    Err(e) => break Err(AgentError::from(e)),
                }
            }
        };

        self.cleanup_agent_state().await;
        result
    }

    /// Handle one frame received from the server
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
            FrameType::StartDataTunnel => {
                info!(tunnel_id = %frame.connection_id, "Received request to start data tunnel");
                let agent = self.clone();
                let id = frame.connection_id.clone();
                let handle = tokio::spawn(run_tunnel(agent, frame.connection_id));
                self.track_task(id, handle);
            }
            FrameType::Data => match self.inner.registry.get(&frame.connection_id) {
                Some(tunnel) => {
                    if let Err(e) = tunnel.write_backend(&frame.payload).await {
                        warn!(
                            tunnel_id = %frame.connection_id,
                            error = %e,
                            "Error writing to local backend"
                        );
                        self.close_local_tunnel(
                            &frame.connection_id,
                            LocalCloseReason::BackendWrite(e.to_string()),
                        )
                        .await;
                    }
                }
                None => {
                    debug!(
                        tunnel_id = %frame.connection_id,
                        "DATA for unknown tunnel, replying CLOSE"
                    );
                    let _ = self
                        .send_to_server(&Frame::close(
                            frame.connection_id.as_str(),
                            "Tunnel not found or already closed",
                        ))
                        .await;
                }
            },
            FrameType::CloseTunnel => {
                info!(
                    tunnel_id = %frame.connection_id,
                    reason = %frame.close_reason(),
                    "Received CLOSE_TUNNEL from server"
                );
                self.close_local_tunnel(&frame.connection_id, LocalCloseReason::ClosedByServer)
                    .await;
            }
            FrameType::TunnelReady | FrameType::Error => {
                debug!(
                    tunnel_id = %frame.connection_id,
                    kind = ?kind,
                    "Unexpected frame from server, dropping"
                );
            }
        }
    }

    /// Send a frame to the server, serialized through the sender mutex
    pub(crate) async fn send_to_server(&self, frame: &Frame) -> Result<(), AgentError> {
        let mut slot = self.inner.sender.lock().await;
        let sender = slot.as_mut().ok_or(AgentError::ControlStreamUnavailable)?;

        sender.send(frame).await.map_err(|e| {
            warn!(
                frame_type = frame.frame_type,
                tunnel_id = %frame.connection_id,
                error = %e,
                "Error sending frame to server"
            );
            AgentError::from(e)
        })
    }

    /// Close one local tunnel: remove, cancel, close socket, maybe notify
    pub(crate) async fn close_local_tunnel(&self, id: &str, reason: LocalCloseReason) {
        let Some(tunnel) = self.inner.registry.remove(id) else {
            return;
        };

        info!(tunnel_id = %id, reason = %reason, "Closing local tunnel");

        tunnel.cancel.cancel();
        tunnel.shutdown_backend().await;

        if reason.notify_server() {
            if let Err(e) = self
                .send_to_server(&Frame::close(id, reason.to_string()))
                .await
            {
                debug!(tunnel_id = %id, error = %e, "Failed to send CLOSE_TUNNEL notification");
            }
        }
    }

    /// Close every local tunnel without notifying, then await all pumps
    async fn cleanup_agent_state(&self) {
        info!("Cleaning up agent state: closing active local tunnels");

        // Presence first, so racing tunnel tasks stop registering
        self.inner.link_up.store(false, Ordering::SeqCst);
        *self.inner.sender.lock().await = None;

        for id in self.inner.registry.ids() {
            self.close_local_tunnel(&id, LocalCloseReason::LinkLost)
                .await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = match self.inner.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        info!("All local tunnels closed");
    }

    fn track_task(&self, id: String, handle: JoinHandle<()>) {
        // A task that already finished has nothing left to await
        if handle.is_finished() {
            return;
        }
        let mut tasks = match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A stale entry for the same id can only be a finished task
        if let Some(old) = tasks.insert(id, handle) {
            old.abort();
        }
    }

    pub(crate) fn untrack_task(&self, id: &str) {
        let mut tasks = match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AgentConfig {
        AgentConfig {
            server_addr: "tunnel.example.com:50051".to_string(),
            backend_addr: "127.0.0.1:3050".to_string(),
            auth_token: "secret".to_string(),
            ca_cert: None,
            insecure: false,
            skip_verify: false,
        }
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("relay.example.com:4443", "server").is_ok());
        assert!(validate_address("localhost:8080", "server").is_ok());
        assert!(validate_address("192.168.1.100:3050", "backend").is_ok());

        assert!(validate_address("relay.example.com", "server").is_err());
        assert!(validate_address("relay.example.com:", "server").is_err());
        assert!(validate_address("relay.example.com:abc", "server").is_err());
        assert!(validate_address(":4443", "server").is_err());
        assert!(validate_address("", "backend").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(base_config().validate().is_ok());

        let mut config = base_config();
        config.auth_token = String::new();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.backend_addr = "no-port".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_new_agent_is_idle() {
        let agent = Agent::new(base_config(), CancellationToken::new()).unwrap();
        assert!(!agent.link_up());
        assert_eq!(agent.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_send_without_stream_fails() {
        let agent = Agent::new(base_config(), CancellationToken::new()).unwrap();
        let result = agent.send_to_server(&Frame::ready("t1")).await;
        assert!(matches!(result, Err(AgentError::ControlStreamUnavailable)));
    }
}
