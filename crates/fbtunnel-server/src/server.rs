//! Server assembly: bind listeners, build TLS, run both accept loops

use crate::config::ServerConfig;
use crate::listener::run_public_listener;
use crate::registry::TunnelRegistry;
use crate::session::AgentSession;
use crate::ServerError;
use fbtunnel_transport::server_acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The tunnel server: one control listener, one public listener
pub struct TunnelServer {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
    session: AgentSession,
    control_listener: TcpListener,
    public_listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl TunnelServer {
    /// Validate configuration, build TLS, and bind both listeners
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let tls = if config.insecure {
            None
        } else {
            let cert = config
                .cert_path
                .as_ref()
                .ok_or_else(|| ServerError::Config("TLS certificate path missing".to_string()))?;
            let key = config
                .key_path
                .as_ref()
                .ok_or_else(|| ServerError::Config("TLS key path missing".to_string()))?;
            Some(server_acceptor(cert, key)?)
        };

        let control_listener = TcpListener::bind(&config.control_addr).await?;
        let public_listener = TcpListener::bind(&config.public_addr).await?;

        let registry = Arc::new(TunnelRegistry::new());
        let session = AgentSession::new(config.auth_token.clone(), registry.clone());

        Ok(Self {
            config,
            registry,
            session,
            control_listener,
            public_listener,
            tls,
        })
    }

    /// Bound address of the agent control listener
    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control_listener.local_addr()
    }

    /// Bound address of the public client listener
    pub fn public_addr(&self) -> std::io::Result<SocketAddr> {
        self.public_listener.local_addr()
    }

    /// Handle for observing server state while `serve` runs
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            session: self.session.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Run both accept loops until the root token fires
    pub async fn serve(self, root: CancellationToken) {
        info!(
            control = %self.control_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            public = %self.public_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "Tunnel server running"
        );

        let control = tokio::spawn(self.session.clone().run_control_listener(
            self.control_listener,
            self.tls.clone(),
            root.clone(),
        ));
        let public = tokio::spawn(run_public_listener(
            self.session.clone(),
            self.public_listener,
            self.config.ready_timeout,
            self.config.max_tunnels,
            root.clone(),
        ));

        let _ = control.await;
        let _ = public.await;
    }
}

/// Cheap observer handle over the running server's shared state
#[derive(Clone)]
pub struct ServerHandle {
    session: AgentSession,
    registry: Arc<TunnelRegistry>,
}

impl ServerHandle {
    pub fn agent_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn active_tunnels(&self) -> usize {
        self.registry.len()
    }
}
