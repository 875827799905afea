//! CONNECT tunnels through the upstream proxy.
//!
//! The handler owns the client socket from the moment its CONNECT head has
//! been read. It obtains an upstream tunnel (HTTP CONNECT or SOCKS), races
//! that against the connection timeout and the client hanging up, and then
//! splices the two sockets together while counting traffic.

use crate::error::ChainError;
use crate::handler::base::{close_stream, expire_at, HandlerBase, HandlerConfig, HandlerKind, Lifecycle};
use crate::handler::connector::{connect_request, HttpConnector, TunnelResult};
use crate::handler::io::{copy_observed, IdleWatch};
use crate::handler::socks::{open_circuit, split_target};
use crate::metrics;
use crate::options::{ProxyDescriptor, ProxyType};
use bytes::BytesMut;
use hyper::http::request::Parts;
use hyper::{Method, Request, Version};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Client bytes buffered while the upstream tunnel is being set up.
const MAX_PENDING: usize = 64 * 1024;

/// A parsed CONNECT request head.
#[derive(Debug)]
pub struct ConnectRequest {
    pub parts: Parts,
    /// Request target as received, `host:port`.
    pub target: String,
    /// `"1.0"` or `"1.1"`, used for error status lines.
    pub http_version: &'static str,
    /// Headers in arrival order with their original case.
    pub raw_headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(
        target: impl Into<String>,
        version: Version,
        raw_headers: Vec<(String, String)>,
    ) -> Result<Self, ChainError> {
        let target = target.into();
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(target.as_str())
            .version(version);
        for (name, value) in &raw_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let parts = builder
            .body(())
            .map_err(|e| ChainError::BadRequest(format!("invalid CONNECT request: {e}")))?
            .into_parts()
            .0;
        let http_version = if version == Version::HTTP_10 { "1.0" } else { "1.1" };
        Ok(Self {
            parts,
            target,
            http_version,
            raw_headers,
        })
    }
}

/// Where a tunnel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    AwaitingUpstream,
    TunnelActive,
    Failed,
    Closed,
}

/// What happened to a tunnel, reported once the handler has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOutcome {
    pub state: TunnelState,
    pub established: bool,
    /// Status code of the error line written to the client, if one was.
    pub error_status: Option<u16>,
}

enum Race {
    Upstream(TunnelResult),
    TimedOut,
    ClientGone(&'static str),
}

enum PipeEnd {
    Client(io::Result<u64>),
    Upstream(io::Result<u64>),
    Idle,
}

/// Handles one CONNECT request.
pub struct ConnectionHandler<S> {
    base: HandlerBase,
    request: ConnectRequest,
    client: Option<S>,
    upstream: Option<TcpStream>,
    connector: Option<HttpConnector>,
    pending: BytesMut,
    state: TunnelState,
    established: bool,
    error_status: Option<u16>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `head` holds client bytes read past the end of the CONNECT head.
    pub fn new(config: Arc<HandlerConfig>, request: ConnectRequest, client: S, head: &[u8]) -> Self {
        let mut pending = BytesMut::with_capacity(head.len().max(1024));
        pending.extend_from_slice(head);
        Self {
            base: HandlerBase::new(HandlerKind::Connection, config),
            request,
            client: Some(client),
            upstream: None,
            connector: None,
            pending,
            state: TunnelState::Init,
            established: false,
            error_status: None,
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        self.base.lifecycle()
    }

    /// Drive the tunnel to completion.
    pub async fn run(mut self) -> TunnelOutcome {
        let descriptor = match self.base.run(&self.request.parts) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.fail(e).await;
                return self.outcome();
            }
        };
        self.state = TunnelState::AwaitingUpstream;

        let race = self.await_upstream(&descriptor).await;
        match race {
            Race::Upstream(TunnelResult::Established {
                protocol,
                stream,
                description,
                ..
            }) => {
                self.base.disarm_timeout();
                self.upstream = Some(stream);
                self.splice(&protocol, &description).await;
            }
            Race::Upstream(TunnelResult::Failed {
                status_code,
                description,
            }) => {
                self.base.disarm_timeout();
                self.fail(ChainError::UpstreamProtocol(status_code, description))
                    .await;
            }
            Race::TimedOut => {
                let timeout = self.base.config().connection_timeout.unwrap_or_default();
                self.fail(ChainError::UpstreamTimeout(timeout)).await;
            }
            Race::ClientGone(reason) => {
                self.close(reason).await;
            }
        }
        self.outcome()
    }

    async fn await_upstream(&mut self, descriptor: &ProxyDescriptor) -> Race {
        let idle_timeout = self.base.config().idle_timeout;
        let deadline = self.base.deadline();
        let Some(client) = self.client.as_mut() else {
            return Race::ClientGone("client missing");
        };
        let upstream = obtain_upstream(descriptor, &self.request, &mut self.connector, idle_timeout);
        race_upstream(upstream, deadline, client, &mut self.pending).await
    }

    async fn splice(&mut self, protocol: &str, description: &str) {
        let (Some(mut client), Some(upstream)) = (self.client.take(), self.upstream.take())
        else {
            self.close("stream missing").await;
            return;
        };
        let lifecycle = Arc::clone(self.base.lifecycle());
        let leftover = self
            .connector
            .as_mut()
            .map(HttpConnector::take_leftover)
            .unwrap_or_default();

        let greeting = format!("{} 200 {}\r\n\r\n", protocol, description);
        let greeted = async {
            client.write_all(greeting.as_bytes()).await?;
            client.write_all(&leftover).await?;
            client.flush().await
        }
        .await;
        self.client = Some(client);
        self.upstream = Some(upstream);
        if let Err(e) = greeted {
            self.base
                .debug_log(format_args!("client write failed: {}", e));
            self.close("client error").await;
            return;
        }
        lifecycle.download(leftover.len());

        self.state = TunnelState::TunnelActive;
        self.established = true;
        metrics::record_tunnel_established();
        self.base.debug_log(format_args!("tunnel to {} established", self.request.target));

        let (Some(client), Some(mut upstream)) = (self.client.take(), self.upstream.take()) else {
            return;
        };
        if !self.pending.is_empty() {
            let early = self.pending.split();
            if let Err(e) = upstream.write_all(&early).await {
                self.client = Some(client);
                self.upstream = Some(upstream);
                self.base.debug_log(format_args!("upstream write failed: {}", e));
                self.tunnel_failure("upstream error").await;
                return;
            }
            lifecycle.upload(early.len());
        }

        let idle_timeout = self.base.config().idle_timeout;
        let watch = IdleWatch::new();
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let end = {
            let (mut upstream_read, mut upstream_write) = upstream.split();
            tokio::select! {
                result = copy_observed(&mut client_read, &mut upstream_write, |n| {
                    watch.touch();
                    lifecycle.upload(n);
                }) => PipeEnd::Client(result),
                result = copy_observed(&mut upstream_read, &mut client_write, |n| {
                    watch.touch();
                    lifecycle.download(n);
                }) => PipeEnd::Upstream(result),
                _ = watch.expired(idle_timeout) => PipeEnd::Idle,
            }
        };
        self.client = Some(client_read.unsplit(client_write));
        self.upstream = Some(upstream);

        match end {
            PipeEnd::Client(Ok(_)) => self.close("client end").await,
            PipeEnd::Client(Err(e)) => {
                self.base.debug_log(format_args!("client side failed: {}", e));
                self.close("client error").await;
            }
            PipeEnd::Upstream(Ok(_)) => self.tunnel_failure("upstream end").await,
            PipeEnd::Upstream(Err(e)) => {
                self.base.debug_log(format_args!("upstream side failed: {}", e));
                self.tunnel_failure("upstream error").await;
            }
            PipeEnd::Idle => self.tunnel_failure("idle timeout").await,
        }
    }

    /// The upstream went away after the tunnel opened. The client has
    /// already received its 200, so no status line follows it into the
    /// tunnel.
    async fn tunnel_failure(&mut self, reason: &'static str) {
        self.state = TunnelState::Failed;
        self.base.lifecycle().claim_error();
        metrics::record_handler_failure(HandlerKind::Connection.as_str(), 500);
        self.close(reason).await;
    }

    async fn fail(&mut self, err: ChainError) {
        self.state = TunnelState::Failed;
        self.base
            .warn_log(format_args!("CONNECT {} failed: {}", self.request.target, err));
        if let Some((code, description)) = err.status() {
            metrics::record_handler_failure(HandlerKind::Connection.as_str(), code);
            self.send_error(code, &description).await;
        }
        self.close("failed").await;
    }

    /// Write an error status line to the client, at most once.
    async fn send_error(&mut self, code: u16, description: &str) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if !self.base.lifecycle().claim_error() {
            return;
        }
        self.error_status = Some(code);
        let line = format!(
            "HTTP/{} {} {}\r\n\r\n",
            self.request.http_version, code, description
        );
        let written = async {
            client.write_all(line.as_bytes()).await?;
            client.flush().await
        }
        .await;
        if let Err(e) = written {
            self.base
                .debug_log(format_args!("failed to send {} to client: {}", code, e));
        }
    }

    /// Tear everything down. Safe to call more than once.
    async fn close(&mut self, reason: &str) {
        if self.state == TunnelState::Closed {
            return;
        }
        self.base.debug_log(format_args!(
            "closing tunnel to {}: {}",
            self.request.target, reason
        ));
        close_stream(&mut self.client, "client").await;
        close_stream(&mut self.upstream, "upstream").await;
        if let Some(connector) = self.connector.as_mut() {
            connector.close();
        }
        self.base.lifecycle().close();
        self.state = TunnelState::Closed;
    }

    fn outcome(&self) -> TunnelOutcome {
        TunnelOutcome {
            state: self.state,
            established: self.established,
            error_status: self.error_status,
        }
    }
}

/// Race the upstream setup against the deadline and the client.
///
/// Anything the client sends meanwhile is kept in `pending`; the client
/// ending or failing wins the race.
async fn race_upstream<S, F>(
    upstream: F,
    deadline: Option<Instant>,
    client: &mut S,
    pending: &mut BytesMut,
) -> Race
where
    S: AsyncRead + Unpin,
    F: Future<Output = TunnelResult>,
{
    tokio::pin!(upstream);
    let expiry = expire_at(deadline);
    tokio::pin!(expiry);
    loop {
        tokio::select! {
            result = &mut upstream => return Race::Upstream(result),
            _ = &mut expiry => return Race::TimedOut,
            read = client.read_buf(pending), if pending.len() < MAX_PENDING => match read {
                Ok(0) => return Race::ClientGone("client end"),
                Ok(_) => {}
                Err(_) => return Race::ClientGone("client error"),
            },
        }
    }
}

async fn obtain_upstream(
    descriptor: &ProxyDescriptor,
    request: &ConnectRequest,
    connector: &mut Option<HttpConnector>,
    idle_timeout: Option<Duration>,
) -> TunnelResult {
    match descriptor.proxy_type {
        ProxyType::Socks => {
            let Some((host, port)) = split_target(&request.target) else {
                return TunnelResult::connection_error();
            };
            match open_circuit(descriptor, &host, port).await {
                Ok(stream) => TunnelResult::Established {
                    protocol: "HTTP/1.1".to_string(),
                    stream,
                    status_code: "200".to_string(),
                    description: "Connection established".to_string(),
                },
                Err(e) => {
                    debug!("SOCKS tunnel to {} failed: {}", request.target, e);
                    TunnelResult::connection_error()
                }
            }
        }
        ProxyType::Http => {
            let text = connect_request(
                &request.target,
                &request.raw_headers,
                &descriptor.auth_header_value,
            );
            connector
                .insert(HttpConnector::new(
                    descriptor.host.clone(),
                    descriptor.port,
                    text,
                    idle_timeout,
                ))
                .connect()
                .await
        }
    }
}
