//! SOCKS circuits through the upstream proxy.

use crate::error::ChainError;
use crate::options::{ProxyDescriptor, SocksVersion};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};

/// Open a circuit to `host:port` through a SOCKS upstream.
///
/// The returned stream is already past the SOCKS handshake and speaks
/// directly to the destination.
pub async fn open_circuit(
    descriptor: &ProxyDescriptor,
    host: &str,
    port: u16,
) -> Result<TcpStream, ChainError> {
    let proxy = (descriptor.host.as_str(), descriptor.port);
    let target = (host, port);
    let connect_error = |e: tokio_socks::Error| {
        ChainError::UpstreamConnect(descriptor.authority(), e.to_string())
    };

    let stream = match descriptor.socks_version.unwrap_or(SocksVersion::V5) {
        SocksVersion::V4 => match descriptor.username.as_deref().filter(|u| !u.is_empty()) {
            Some(user_id) => Socks4Stream::connect_with_userid(proxy, target, user_id)
                .await
                .map_err(connect_error)?
                .into_inner(),
            None => Socks4Stream::connect(proxy, target)
                .await
                .map_err(connect_error)?
                .into_inner(),
        },
        SocksVersion::V5 => match descriptor.credentials() {
            Some((username, password)) => {
                Socks5Stream::connect_with_password(proxy, target, username, password)
                    .await
                    .map_err(connect_error)?
                    .into_inner()
            }
            None => Socks5Stream::connect(proxy, target)
                .await
                .map_err(connect_error)?
                .into_inner(),
        },
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Split a CONNECT target or URL authority into host and port.
///
/// IPv6 brackets are removed and a missing port defaults to 80.
pub fn split_target(target: &str) -> Option<(String, u16)> {
    if target.is_empty() {
        return None;
    }
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => 80,
        };
        (host, port)
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().ok()?),
            Some(_) => (target, 80),
            None => (target, 80),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
