//! Listener, TLS and admin endpoint configuration.

use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, IpAddr, SocketAddr};

/// TLS material for serving the inbound side over HTTPS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to TLS certificate chain (PEM format)
    pub cert_path: String,
    /// Path to TLS private key (PEM format)
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        socket_addr(&self.host, self.port)
    }
}

/// Admin endpoint serving metrics, traffic totals and health.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_host")]
    pub host: String,
    pub port: u16,
}

impl AdminConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        socket_addr(&self.host, self.port)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, AddrParseError> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = host.parse()?;
    Ok(SocketAddr::new(ip, port))
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}
