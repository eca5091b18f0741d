//! Server configuration

use crate::ServerError;
use std::path::PathBuf;
use std::time::Duration;

/// Tunnel server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for remote clients
    pub public_addr: String,

    /// Listen address for the agent control stream
    pub control_addr: String,

    /// Shared secret the agent must present
    pub auth_token: String,

    /// TLS certificate chain (PEM), required unless `insecure`
    pub cert_path: Option<PathBuf>,

    /// TLS private key (PEM), required unless `insecure`
    pub key_path: Option<PathBuf>,

    /// Run the control channel over plain TCP (never in production)
    pub insecure: bool,

    /// Optional cap on concurrent tunnels; `None` means unlimited
    pub max_tunnels: Option<usize>,

    /// How long to wait for the agent's `TUNNEL_READY` confirmation
    pub ready_timeout: Duration,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.auth_token.is_empty() {
            return Err(ServerError::Config("auth token is required".to_string()));
        }
        if !self.insecure && (self.cert_path.is_none() || self.key_path.is_none()) {
            return Err(ServerError::Config(
                "TLS certificate and key are required unless insecure mode is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalize a listen-address value
///
/// Operators historically set the port variables to a bare port (`5050`) or
/// a `:port` form; both expand to an all-interfaces listen address. A full
/// `host:port` passes through untouched.
pub fn listen_addr(value: &str) -> String {
    if value.parse::<u16>().is_ok() {
        return format!("0.0.0.0:{}", value);
    }
    if let Some(port) = value.strip_prefix(':') {
        if port.parse::<u16>().is_ok() {
            return format!("0.0.0.0:{}", port);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            public_addr: "127.0.0.1:0".to_string(),
            control_addr: "127.0.0.1:0".to_string(),
            auth_token: "secret".to_string(),
            cert_path: None,
            key_path: None,
            insecure: true,
            max_tunnels: None,
            ready_timeout: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_validate_ok_insecure() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_token() {
        let mut config = base_config();
        config.auth_token = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_tls_material() {
        let mut config = base_config();
        config.insecure = false;
        assert!(config.validate().is_err());

        config.cert_path = Some(PathBuf::from("server.crt"));
        config.key_path = Some(PathBuf::from("server.key"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr_forms() {
        assert_eq!(listen_addr("5050"), "0.0.0.0:5050");
        assert_eq!(listen_addr(":5050"), "0.0.0.0:5050");
        assert_eq!(listen_addr("127.0.0.1:5050"), "127.0.0.1:5050");
        assert_eq!(listen_addr("example.com:5050"), "example.com:5050");
    }
}
