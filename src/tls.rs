//! TLS Module
//!
//! Builds the rustls acceptor for the `ssl_port` listener from the
//! configured PEM certificate chain and private key.

use crate::config::ServerConfig;
use crate::{GatewayError, Result};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load the certificate chain and key named in the server configuration and
/// build a TLS acceptor for the secure listener.
pub fn build_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&config.ssl_certfile).map_err(|e| {
        GatewayError::TlsError(format!(
            "Failed to open ssl_certfile {}: {}",
            config.ssl_certfile, e
        ))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| GatewayError::TlsError(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::TlsError(format!(
            "No certificates found in {}",
            config.ssl_certfile
        )));
    }

    let key_file = std::fs::File::open(&config.ssl_keyfile).map_err(|e| {
        GatewayError::TlsError(format!(
            "Failed to open ssl_keyfile {}: {}",
            config.ssl_keyfile, e
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| GatewayError::TlsError(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| {
            GatewayError::TlsError(format!("No private key found in {}", config.ssl_keyfile))
        })?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::TlsError(format!("Invalid certificate/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
