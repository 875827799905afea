//! Listening socket and TLS termination for the chain's inbound side.

use crate::error::ChainError;
use rustls::pki_types::CertificateDer;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener with SO_REUSEADDR so a restarted chain can rebind at once.
pub fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn create_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, ChainError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        ChainError::Tls(format!(
            "Failed to open certificate file '{}': {e}",
            cert_path.display()
        ))
    })?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ChainError::Tls(format!("Failed to parse certificate file: {e}")))?;

    if certs.is_empty() {
        return Err(ChainError::Tls(format!(
            "No certificates found in certificate file: {}",
            cert_path.display()
        )));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        ChainError::Tls(format!(
            "Failed to open private key file '{}': {e}",
            key_path.display()
        ))
    })?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ChainError::Tls(format!("Failed to parse private key file: {e}")))?
        .ok_or_else(|| {
            ChainError::Tls(format!(
                "No private key found in key file: {}",
                key_path.display()
            ))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ChainError::Tls(format!("Failed to build TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_create_listener_on_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_missing_certificate_file() {
        let err = create_tls_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to open certificate file"));
    }

    #[test]
    fn test_empty_certificate_file() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        let err = create_tls_acceptor(cert.path(), cert.path()).err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }
}
