//! Accept loop and per-connection classification.
//!
//! Each accepted connection has its first request head sniffed. A CONNECT
//! hands the raw stream (plus any bytes read past the head) to a tunnel
//! handler; anything else is replayed into a hyper HTTP/1 connection whose
//! requests are forwarded one by one.

use crate::chain::dispatch::Dispatcher;
use crate::handler::{ConnectRequest, PrefixedStream};
use bytes::BytesMut;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Version;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Largest request head accepted while classifying a connection.
const MAX_REQUEST_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Time a fresh connection has to deliver its first request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A running accept loop.
pub(crate) struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already being served run to completion.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            debug!("accept loop ended abnormally: {}", e);
        }
    }
}

pub(crate) fn spawn(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(accept_loop(listener, dispatcher, tls, shutdown_rx));
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tls: Option<TlsAcceptor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    let dispatcher = Arc::clone(&dispatcher);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    serve_connection(dispatcher, tls_stream, peer, HEAD_READ_TIMEOUT).await
                                }
                                Err(e) => debug!("TLS handshake failed from {}: {}", peer, e),
                            },
                            None => serve_connection(dispatcher, stream, peer, HEAD_READ_TIMEOUT).await,
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            },
            _ = shutdown_rx.recv() => {
                if let Ok(addr) = listener.local_addr() {
                    info!("proxy chain on {} shutting down", addr);
                }
                break;
            }
        }
    }
}

enum Sniffed {
    /// CONNECT request whose head is `usize` bytes long.
    Connect(ConnectRequest, usize),
    Plain,
    Partial,
    Invalid(String),
}

fn sniff(buf: &[u8]) -> Sniffed {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            if request.method != Some("CONNECT") {
                return Sniffed::Plain;
            }
            let target = request.path.unwrap_or_default();
            let version = if request.version == Some(0) {
                Version::HTTP_10
            } else {
                Version::HTTP_11
            };
            let raw_headers = request
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            match ConnectRequest::new(target, version, raw_headers) {
                Ok(connect) => Sniffed::Connect(connect, head_len),
                Err(e) => Sniffed::Invalid(e.to_string()),
            }
        }
        Ok(httparse::Status::Partial) => match request.method {
            Some(method) if method != "CONNECT" => Sniffed::Plain,
            _ => Sniffed::Partial,
        },
        Err(httparse::Error::TooManyHeaders) => Sniffed::Invalid("too many headers".to_string()),
        // hyper answers malformed plain requests itself.
        Err(_) => Sniffed::Plain,
    }
}

/// Outcome of reading the first request head on a connection.
enum FirstHead {
    Connect(ConnectRequest, usize),
    Plain,
    Closed,
    Rejected(String),
}

async fn read_first_head<S>(stream: &mut S, buf: &mut BytesMut, peer: SocketAddr) -> FirstHead
where
    S: AsyncRead + Unpin,
{
    loop {
        match stream.read_buf(buf).await {
            Ok(0) => return FirstHead::Closed,
            Ok(_) => {}
            Err(e) => {
                debug!("read from {} failed: {}", peer, e);
                return FirstHead::Closed;
            }
        }
        match sniff(buf) {
            Sniffed::Connect(request, head_len) => return FirstHead::Connect(request, head_len),
            Sniffed::Plain => return FirstHead::Plain,
            Sniffed::Partial if buf.len() < MAX_REQUEST_HEAD => continue,
            Sniffed::Partial => return FirstHead::Rejected("request head too large".to_string()),
            Sniffed::Invalid(reason) => return FirstHead::Rejected(reason),
        }
    }
}

async fn serve_connection<S>(
    dispatcher: Arc<Dispatcher>,
    mut stream: S,
    peer: SocketAddr,
    head_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);
    let first = tokio::time::timeout(head_timeout, read_first_head(&mut stream, &mut buf, peer)).await;
    match first {
        Ok(FirstHead::Connect(request, head_len)) => {
            let head = buf.split_off(head_len);
            dispatcher.make_connection(request, stream, &head).await;
            return;
        }
        Ok(FirstHead::Plain) => {}
        Ok(FirstHead::Closed) => return,
        Ok(FirstHead::Rejected(reason)) => {
            reject(&mut stream, peer, &reason).await;
            return;
        }
        Err(_) => {
            debug!("no request head from {} within {:?}", peer, head_timeout);
            let _ = stream.shutdown().await;
            return;
        }
    }

    let io = TokioIo::new(PrefixedStream::new(buf.freeze(), stream));
    let service = service_fn(move |req| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(dispatcher.make_request(req).await) }
    });
    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
    {
        debug!("Error serving connection from {}: {}", peer, e);
    }
}

async fn reject<S>(stream: &mut S, peer: SocketAddr, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    debug!("rejecting connection from {}: {}", peer, reason);
    let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;

    #[test]
    fn test_sniff_connect_keeps_trailing_bytes_out_of_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01";
        match sniff(raw) {
            Sniffed::Connect(request, head_len) => {
                assert_eq!(request.target, "example.com:443");
                assert_eq!(request.http_version, "1.1");
                assert_eq!(request.raw_headers[0].0, "Host");
                assert_eq!(&raw[head_len..], b"\x16\x03\x01");
            }
            _ => panic!("expected a CONNECT"),
        }
    }

    #[test]
    fn test_sniff_plain_before_head_completes() {
        assert!(matches!(sniff(b"GET http://a/ HTTP/1.1\r\nHo"), Sniffed::Plain));
    }

    #[test]
    fn test_sniff_partial_connect() {
        assert!(matches!(
            sniff(b"CONNECT a:443 HTTP/1.1\r\nHost: a"),
            Sniffed::Partial
        ));
        assert!(matches!(sniff(b"CONN"), Sniffed::Partial));
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_after_head_timeout() {
        let dispatcher = Arc::new(Dispatcher::new(HandlerConfig::new(None), None));
        let (mut client, server) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(serve_connection(
            dispatcher,
            server,
            peer,
            Duration::from_millis(50),
        ));

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection should be closed")
            .unwrap();
        assert_eq!(n, 0);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_partial_head_is_dropped_after_head_timeout() {
        let dispatcher = Arc::new(Dispatcher::new(HandlerConfig::new(None), None));
        let (mut client, server) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        tokio::spawn(serve_connection(
            dispatcher,
            server,
            peer,
            Duration::from_millis(50),
        ));

        client.write_all(b"CONNECT a:443 HTTP/1.1\r\nHo").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection should be closed")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_sniff_http10_connect() {
        match sniff(b"CONNECT a:443 HTTP/1.0\r\n\r\n") {
            Sniffed::Connect(request, _) => assert_eq!(request.http_version, "1.0"),
            _ => panic!("expected a CONNECT"),
        }
    }
}
