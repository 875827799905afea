//! HTTP CONNECT handshake against an upstream HTTP proxy.

use crate::error::{CONNECTION_ERROR, GATEWAY_TIMEOUT};
use crate::handler::io::read_idle;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Largest upstream response head accepted during the handshake.
const MAX_HANDSHAKE_HEAD: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Result of asking an upstream for a tunnel.
#[derive(Debug)]
pub enum TunnelResult {
    /// The upstream answered 200; `stream` now carries the tunnel.
    Established {
        protocol: String,
        stream: TcpStream,
        status_code: String,
        description: String,
    },
    /// The upstream refused, failed or timed out.
    Failed {
        status_code: String,
        description: String,
    },
}

impl TunnelResult {
    pub fn connection_error() -> Self {
        TunnelResult::Failed {
            status_code: CONNECTION_ERROR.0.to_string(),
            description: CONNECTION_ERROR.1.to_string(),
        }
    }

    pub fn gateway_timeout() -> Self {
        TunnelResult::Failed {
            status_code: GATEWAY_TIMEOUT.0.to_string(),
            description: GATEWAY_TIMEOUT.1.to_string(),
        }
    }

    pub fn status_code(&self) -> &str {
        match self {
            TunnelResult::Established { status_code, .. }
            | TunnelResult::Failed { status_code, .. } => status_code,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            TunnelResult::Established { description, .. }
            | TunnelResult::Failed { description, .. } => description,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, TunnelResult::Established { .. })
    }
}

/// Build the CONNECT request sent to an HTTP upstream.
///
/// `headers` are the client's headers as received, in order and with their
/// original case. Any client `Proxy-Authorization` is replaced by `auth`.
pub fn connect_request(target: &str, headers: &[(String, String)], auth: &str) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\n", target);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    if !auth.is_empty() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Split an upstream status line into protocol, code and description.
fn parse_status_line(line: &str) -> (String, String, String) {
    let mut parts = line.splitn(3, ' ');
    let protocol = parts.next().unwrap_or_default().to_string();
    let code = parts.next().unwrap_or_default().to_string();
    let description = parts.next().unwrap_or_default().trim_end().to_string();
    (protocol, code, description)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Opens a TCP connection to an HTTP proxy and performs the CONNECT
/// handshake.
///
/// Bytes the upstream sends after its response head arrive in the same reads
/// as the head; they are kept and handed out through [`take_leftover`] so
/// nothing sent through the tunnel is lost.
///
/// [`take_leftover`]: HttpConnector::take_leftover
#[derive(Debug)]
pub struct HttpConnector {
    host: String,
    port: u16,
    request: String,
    idle_timeout: Option<Duration>,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    leftover: Bytes,
    closed: bool,
}

impl HttpConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        request: impl Into<String>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            request: request.into(),
            idle_timeout,
            stream: None,
            buffer: BytesMut::with_capacity(1024),
            leftover: Bytes::new(),
            closed: false,
        }
    }

    /// Connect, send the CONNECT request and wait for the response head.
    ///
    /// Never fails: transport problems become a 500 result and inactivity a
    /// 504 result, in both cases with the socket torn down.
    pub async fn connect(&mut self) -> TunnelResult {
        if self.closed {
            return TunnelResult::connection_error();
        }
        match self.handshake().await {
            Ok(result) => result,
            Err(e) => {
                debug!("CONNECT handshake with {}:{} failed: {}", self.host, self.port, e);
                self.close();
                if e.kind() == io::ErrorKind::TimedOut {
                    TunnelResult::gateway_timeout()
                } else {
                    TunnelResult::connection_error()
                }
            }
        }
    }

    async fn handshake(&mut self) -> io::Result<TunnelResult> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??,
            None => connect.await?,
        };
        stream.set_nodelay(true).ok();
        let stream = self.stream.insert(stream);

        stream.write_all(self.request.as_bytes()).await?;
        stream.flush().await?;

        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = read_idle(stream, &mut chunk, self.idle_timeout).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed during handshake",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find_terminator(&self.buffer) {
                break pos;
            }
            if self.buffer.len() > MAX_HANDSHAKE_HEAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upstream response head too large",
                ));
            }
        };

        let head = self.buffer.split_to(head_end + HEAD_TERMINATOR.len());
        let head = String::from_utf8_lossy(&head[..head_end]);
        let status_line = head.split("\r\n").next().unwrap_or_default();
        let (protocol, status_code, description) = parse_status_line(status_line);

        if status_code != "200" {
            self.close();
            return Ok(TunnelResult::Failed {
                status_code,
                description,
            });
        }

        self.leftover = self.buffer.split().freeze();
        let stream = self.stream.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connector already closed")
        })?;
        Ok(TunnelResult::Established {
            protocol,
            stream,
            status_code,
            description,
        })
    }

    /// Bytes received after the 200 response head, handed out once.
    pub fn take_leftover(&mut self) -> Bytes {
        std::mem::take(&mut self.leftover)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Destroy the handshake socket. Safe to call any number of times.
    pub fn close(&mut self) {
        self.closed = true;
        self.stream = None;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accept one connection, read the request head, answer with `reply`.
    async fn fake_proxy(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<(String, TcpStream)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while find_terminator(&received).is_none() {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply).await.unwrap();
            (String::from_utf8(received).unwrap(), socket)
        });
        (port, task)
    }

    #[test]
    fn test_connect_request_replaces_auth() {
        let headers = vec![
            ("Host".to_string(), "example.com:443".to_string()),
            ("Proxy-Authorization".to_string(), "Basic client".to_string()),
            ("X-Trace".to_string(), "1".to_string()),
        ];
        let request = connect_request("example.com:443", &headers, "Basic dTpw");
        assert_eq!(
            request,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nX-Trace: 1\r\n\
             Proxy-Authorization: Basic dTpw\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_without_auth() {
        let request = connect_request("h:1", &[], "");
        assert_eq!(request, "CONNECT h:1 HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_parse_status_line() {
        let (protocol, code, description) =
            parse_status_line("HTTP/1.1 407 Proxy Authentication Required");
        assert_eq!(protocol, "HTTP/1.1");
        assert_eq!(code, "407");
        assert_eq!(description, "Proxy Authentication Required");

        let (_, code, description) = parse_status_line("HTTP/1.0 200");
        assert_eq!(code, "200");
        assert_eq!(description, "");
    }

    #[tokio::test]
    async fn test_established_keeps_leftover() {
        let (port, upstream) =
            fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\nPAYLOAD").await;
        let request = connect_request("target:443", &[], "");
        let mut connector = HttpConnector::new("127.0.0.1", port, request, None);

        let result = connector.connect().await;
        let (received, mut upstream_socket) = upstream.await.unwrap();
        assert!(received.starts_with("CONNECT target:443 HTTP/1.1\r\n"));

        let TunnelResult::Established {
            protocol,
            mut stream,
            status_code,
            description,
        } = result
        else {
            panic!("expected an established tunnel");
        };
        assert_eq!(protocol, "HTTP/1.1");
        assert_eq!(status_code, "200");
        assert_eq!(description, "Connection established");
        assert_eq!(&connector.take_leftover()[..], b"PAYLOAD");
        assert!(connector.take_leftover().is_empty());

        upstream_socket.write_all(b"more").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }

    #[tokio::test]
    async fn test_non_200_is_failure() {
        let (port, upstream) = fake_proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let mut connector =
            HttpConnector::new("127.0.0.1", port, connect_request("t:1", &[], ""), None);

        let result = connector.connect().await;
        let _ = upstream.await;
        assert!(!result.is_established());
        assert_eq!(result.status_code(), "403");
        assert_eq!(result.description(), "Forbidden");
        assert!(connector.is_closed());
    }

    #[tokio::test]
    async fn test_refused_connection_is_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut connector =
            HttpConnector::new("127.0.0.1", port, connect_request("t:1", &[], ""), None);
        let result = connector.connect().await;
        assert_eq!(result.status_code(), "500");
        assert_eq!(result.description(), "Connection error");
    }

    #[tokio::test]
    async fn test_idle_upstream_is_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut connector = HttpConnector::new(
            "127.0.0.1",
            port,
            connect_request("t:1", &[], ""),
            Some(Duration::from_millis(50)),
        );
        let result = connector.connect().await;
        assert_eq!(result.status_code(), "504");
        assert_eq!(result.description(), "Gateway Timeout");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut connector = HttpConnector::new("127.0.0.1", 1, "", None);
        connector.close();
        connector.close();
        assert!(connector.is_closed());
        assert_eq!(connector.connect().await.status_code(), "500");
    }
}
