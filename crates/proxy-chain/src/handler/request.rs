//! Plain (non-CONNECT) HTTP requests forwarded through the upstream proxy.
//!
//! HTTP upstreams receive the request in absolute form with the chain's
//! credentials; SOCKS upstreams get a circuit to the destination and the
//! request in origin form.

use crate::error::ChainError;
use crate::handler::base::{expire_at, CloseGuard, HandlerBase, HandlerConfig, HandlerKind, Lifecycle};
use crate::handler::io::CountingStream;
use crate::handler::socks::open_circuit;
use crate::metrics;
use crate::options::{ProxyDescriptor, ProxyType};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1 as client_http1;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Response body type handed back to the server.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Estimated size of a request head on the wire.
///
/// Counted as upload traffic before the body, since the head itself is
/// re-serialized rather than copied.
pub fn estimate_request_head(parts: &Parts) -> usize {
    let version = match parts.version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        _ => "1.1",
    };
    let request_line =
        parts.method.as_str().len() + 1 + parts.uri.to_string().len() + 1 + 5 + version.len() + 2;
    let headers: usize = parts
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();
    request_line + headers + 2
}

/// Handles one plain HTTP request.
pub struct RequestHandler {
    base: HandlerBase,
}

struct Upstream {
    response: Response<Incoming>,
    connection: ConnectionTask,
}

impl RequestHandler {
    pub fn new(config: Arc<HandlerConfig>) -> Self {
        Self {
            base: HandlerBase::new(HandlerKind::Request, config),
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        self.base.lifecycle()
    }

    /// Forward `request` and produce the response for the client.
    ///
    /// The handler stays open until the returned body has been consumed or
    /// dropped.
    pub async fn run<B>(mut self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let lifecycle = Arc::clone(self.base.lifecycle());
        let guard = CloseGuard::new(Arc::clone(&lifecycle));
        let (parts, body) = request.into_parts();

        let descriptor = match self.base.run(&parts) {
            Ok(descriptor) => descriptor,
            Err(e) => return self.fail(e),
        };
        if self.base.config().statistics {
            lifecycle.upload(estimate_request_head(&parts));
        }

        let deadline = self.base.deadline();
        let forwarded = tokio::select! {
            result = forward(&descriptor, parts, body, Arc::clone(&lifecycle)) => result,
            _ = expire_at(deadline) => Err(ChainError::UpstreamTimeout(
                self.base.config().connection_timeout.unwrap_or_default(),
            )),
        };

        match forwarded {
            Ok(upstream) => {
                self.base.disarm_timeout();
                self.base.debug_log(format_args!(
                    "upstream answered {}",
                    upstream.response.status()
                ));
                relay(upstream, lifecycle, guard)
            }
            Err(e) => self.fail(e),
        }
    }

    /// Build the error response for `err` and close the handler.
    fn fail(&self, err: ChainError) -> Response<ProxyBody> {
        self.base.warn_log(format_args!("request failed: {}", err));
        let (code, description) = err
            .status()
            .unwrap_or_else(|| (500, crate::error::CONNECTION_ERROR.1.to_string()));
        let response = if self.base.lifecycle().claim_error() {
            metrics::record_handler_failure(HandlerKind::Request.as_str(), code);
            error_response(code, &description)
        } else {
            error_response(500, crate::error::CONNECTION_ERROR.1)
        };
        self.base.lifecycle().close();
        response
    }
}

/// An empty response with `code` and `description` as its status line.
pub fn error_response(code: u16, description: &str) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() =
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(reason) = ReasonPhrase::try_from(description.to_string()) {
        response.extensions_mut().insert(reason);
    }
    response
}

fn empty_body() -> ProxyBody {
    BoxBody::new(Empty::<Bytes>::new().map_err(|never: Infallible| match never {}))
}

async fn forward<B>(
    descriptor: &ProxyDescriptor,
    mut parts: Parts,
    body: B,
    lifecycle: Arc<Lifecycle>,
) -> Result<Upstream, ChainError>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let stream = match descriptor.proxy_type {
        ProxyType::Http => {
            let stream = TcpStream::connect((descriptor.host.as_str(), descriptor.port))
                .await
                .map_err(|e| ChainError::UpstreamConnect(descriptor.authority(), e.to_string()))?;
            prepare_for_http_proxy(&mut parts, descriptor);
            stream
        }
        ProxyType::Socks => {
            let (host, port) = destination(&parts.uri)?;
            let stream = open_circuit(descriptor, &host, port).await?;
            prepare_for_origin(&mut parts);
            stream
        }
    };
    stream.set_nodelay(true).ok();

    let io = TokioIo::new(CountingStream::new(stream, Arc::clone(&lifecycle)));
    let (mut sender, connection) = client_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;
    let connection = ConnectionTask(tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("upstream connection ended: {}", e);
        }
    }));

    let request = Request::from_parts(parts, ObservedBody::new(body, lifecycle));
    let response = sender.send_request(request).await?;
    Ok(Upstream {
        response,
        connection,
    })
}

/// Absolute-form request for an HTTP proxy, carrying the chain's credentials.
fn prepare_for_http_proxy(parts: &mut Parts, descriptor: &ProxyDescriptor) {
    parts.headers.remove(PROXY_AUTHORIZATION);
    if descriptor.has_auth() {
        if let Ok(value) = HeaderValue::from_str(&descriptor.auth_header_value) {
            parts.headers.insert(PROXY_AUTHORIZATION, value);
        }
    }
}

/// Origin-form request for a destination reached through a SOCKS circuit.
fn prepare_for_origin(parts: &mut Parts) {
    parts.headers.remove(PROXY_AUTHORIZATION);
    if !parts.headers.contains_key(HOST) {
        if let Some(value) = parts
            .uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        {
            parts.headers.insert(HOST, value);
        }
    }
    parts.uri = parts
        .uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));
}

/// Destination host and port of an absolute-form request.
fn destination(uri: &Uri) -> Result<(String, u16), ChainError> {
    let host = uri
        .host()
        .ok_or_else(|| ChainError::BadRequest(format!("no host in {uri}")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_string(), uri.port_u16().unwrap_or(80)))
}

fn relay(upstream: Upstream, lifecycle: Arc<Lifecycle>, guard: CloseGuard) -> Response<ProxyBody> {
    let (parts, body) = upstream.response.into_parts();
    let body = ResponseBody {
        inner: body,
        lifecycle,
        _connection: upstream.connection,
        _guard: guard,
    };

    let mut response = Response::new(BoxBody::new(body));
    *response.status_mut() = parts.status;
    for (name, value) in parts.headers.iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    *response.extensions_mut() = parts.extensions;
    response
}

/// Aborts the upstream connection driver when dropped.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Request body that reports each data frame as upload traffic.
struct ObservedBody<B> {
    inner: B,
    lifecycle: Arc<Lifecycle>,
}

impl<B> ObservedBody<B> {
    fn new(inner: B, lifecycle: Arc<Lifecycle>) -> Self {
        Self { inner, lifecycle }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.lifecycle.upload(data.len());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Upstream response body; closes the handler when it ends, fails or is
/// dropped.
struct ResponseBody {
    inner: Incoming,
    lifecycle: Arc<Lifecycle>,
    _connection: ConnectionTask,
    _guard: CloseGuard,
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("upstream response body failed: {}", e);
                this.lifecycle.close();
            }
            None => {
                this.lifecycle.close();
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::observer::testing::RecordingObserver;
    use crate::options::derive_proxy_descriptor;
    use http_body_util::Full;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> HandlerConfig {
        let url = format!("http://127.0.0.1:{}", port);
        let descriptor = derive_proxy_descriptor(Some(&url), Some("u"), Some("p")).unwrap();
        HandlerConfig::new(Some(Arc::new(descriptor)))
    }

    /// Accept one connection, capture the request head, answer with `reply`.
    async fn fake_proxy(reply: &'static [u8]) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply).await.unwrap();
            String::from_utf8(received).unwrap()
        });
        (port, task)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::get(uri)
            .header("Host", "example.com")
            .header("Proxy-Authorization", "Basic Y2xpZW50")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_absolute_form_with_chain_auth() {
        let (port, upstream) = fake_proxy(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\nhello",
        )
        .await;
        let handler = RequestHandler::new(Arc::new(config_for(port)));
        let response = handler.run(get("http://example.com/path?q=1")).await;

        let head = upstream.await.unwrap();
        assert!(head.starts_with("GET http://example.com/path?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(!head.contains("Y2xpZW50"));

        assert_eq!(response.status(), StatusCode::OK);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_upstream_status_passes_through() {
        let (port, _upstream) =
            fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await;
        let response = RequestHandler::new(Arc::new(config_for(port)))
            .run(get("http://example.com/"))
            .await;
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    }

    #[tokio::test]
    async fn test_rejected_route_is_500() {
        let handler = RequestHandler::new(Arc::new(HandlerConfig::new(None)));
        let lifecycle = Arc::clone(handler.lifecycle());
        let response = handler.run(get("http://example.com/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.extensions().get::<ReasonPhrase>().map(|r| r.as_bytes()),
            Some(&b"Connection error"[..])
        );
        assert!(lifecycle.is_closed());
    }

    #[tokio::test]
    async fn test_slow_upstream_is_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut config = config_for(port);
        config.connection_timeout = Some(Duration::from_millis(100));
        let response = RequestHandler::new(Arc::new(config))
            .run(get("http://example.com/"))
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_statistics_count_head_body_and_response() {
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (port, upstream) = fake_proxy(reply).await;
        let mut config = config_for(port);
        config.statistics = true;
        let handler = RequestHandler::new(Arc::new(config));
        let observer = Arc::new(RecordingObserver::default());
        handler.lifecycle().attach(observer.clone());

        let request = Request::get("http://example.com/")
            .header("Host", "example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (parts, body) = request.into_parts();
        let expected_head = estimate_request_head(&parts);
        let request = Request::from_parts(parts, body);
        let response = handler.run(request).await;
        let _ = upstream.await;
        response.into_body().collect().await.unwrap();

        assert_eq!(observer.uploaded(), expected_head as u64);
        assert_eq!(observer.downloaded(), reply.len() as u64);
        assert_eq!(observer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_statistics_count_request_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            let body_len = loop {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "upstream closed before the body arrived");
                received.extend_from_slice(&buf[..n]);
                if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&received[..end]).to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap();
                    if received.len() >= end + 4 + length {
                        break received.len() - end - 4;
                    }
                }
            };
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            body_len
        });

        let mut config = config_for(port);
        config.statistics = true;
        let handler = RequestHandler::new(Arc::new(config));
        let observer = Arc::new(RecordingObserver::default());
        handler.lifecycle().attach(observer.clone());

        let request = Request::post("http://example.com/upload")
            .header("Host", "example.com")
            .header("Content-Length", "1000")
            .body(Full::new(Bytes::from(vec![b'x'; 1000])))
            .unwrap();
        let (parts, body) = request.into_parts();
        let expected_head = estimate_request_head(&parts);
        let response = handler.run(Request::from_parts(parts, body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        response.into_body().collect().await.unwrap();

        assert_eq!(upstream.await.unwrap(), 1000);
        assert_eq!(observer.uploaded(), (expected_head + 1000) as u64);
    }

    #[test]
    fn test_estimate_request_head() {
        let (parts, _) = Request::get("http://a.test/x")
            .header("Host", "a.test")
            .body(())
            .unwrap()
            .into_parts();
        // "GET" + 1 + "http://a.test/x" + 1 + "HTTP/" + "1.1" + CRLF
        let line = 3 + 1 + 15 + 1 + 5 + 3 + 2;
        // "host" + "a.test" + ": " + CRLF, then the blank line
        assert_eq!(estimate_request_head(&parts), line + (4 + 6 + 4) + 2);
    }

    #[test]
    fn test_prepare_for_origin_strips_to_path() {
        let (mut parts, _) = Request::get("http://a.test:8080/x?y=1")
            .header("Proxy-Authorization", "Basic x")
            .body(())
            .unwrap()
            .into_parts();
        prepare_for_origin(&mut parts);
        assert_eq!(parts.uri, "/x?y=1");
        assert_eq!(parts.headers[HOST], "a.test:8080");
        assert!(!parts.headers.contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_destination_defaults_port_and_unbrackets() {
        let uri: Uri = "http://[::1]/".parse().unwrap();
        assert_eq!(destination(&uri).unwrap(), ("::1".to_string(), 80));
        let uri: Uri = "http://a.test:81/".parse().unwrap();
        assert_eq!(destination(&uri).unwrap(), ("a.test".to_string(), 81));
    }
}
