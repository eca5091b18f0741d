//! TLS configuration for the control channel
//!
//! Server side loads a PEM certificate chain and private key; client side
//! verifies against a custom CA bundle when configured, falling back to the
//! webpki root set. A dangerous skip-verify mode exists for temporary
//! debugging only; callers are expected to log loudly before enabling it.

use crate::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const ALPN_PROTOCOL: &[u8] = b"fbtunnel/1";

/// Build a rustls TlsAcceptor from PEM cert/key paths
pub fn server_acceptor(cert_path: &Path, key_path: &Path) -> TransportResult<TlsAcceptor> {
    ensure_crypto_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Invalid cert/key: {}", e)))?;

    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_crypto)))
}

/// Build a rustls TlsConnector for the agent
///
/// `ca_cert` adds a custom CA bundle as the only trust anchors; otherwise
/// the webpki root set is used. `skip_verify` disables server-certificate
/// verification entirely (INSECURE).
pub fn client_connector(
    ca_cert: Option<&Path>,
    skip_verify: bool,
) -> TransportResult<TlsConnector> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();

    if let Some(path) = ca_cert {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut client_crypto = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(TlsConnector::from(Arc::new(client_crypto)))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::Tls("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
