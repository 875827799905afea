//! The proxy chain: composition root tying the transport to the handlers.

mod dispatch;
mod listener;
mod server;
mod stats;

pub use listener::{create_listener, create_tls_acceptor};
pub use stats::{TrafficSample, TrafficStats, TrafficTotals};

use crate::config::TlsConfig;
use crate::error::ChainError;
use crate::handler::{
    ConnectRequest, HandlerConfig, ProxyBody, TunnelOutcome, Verbosity,
};
use crate::options::{derive_proxy_descriptor, make_auth, ProxyDescriptor};
use crate::routing::{DefaultRouter, RequestRouter};
use bytes::Bytes;
use dispatch::Dispatcher;
use hyper::body::Body;
use hyper::{Request, Response};
use server::ServerHandle;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Connection timeout used when none is configured.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything needed to build a [`ProxyChain`].
#[derive(Clone)]
pub struct ChainOptions {
    pub listen_addr: SocketAddr,
    /// Upstream proxy URL: `http`, `https`, `socks`, `socks4` or `socks5`.
    pub proxy_url: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub verbosity: Verbosity,
    /// Zero disables the timeout.
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Serve the inbound side over TLS.
    pub tls: Option<TlsConfig>,
    pub statistics: bool,
    pub router: Arc<dyn RequestRouter>,
    pub proxy_id: Option<String>,
}

impl ChainOptions {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            verbosity: Verbosity::Silent,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            idle_timeout: None,
            tls: None,
            statistics: false,
            router: Arc::new(DefaultRouter),
            proxy_id: None,
        }
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }

    pub fn with_router(mut self, router: impl RequestRouter + 'static) -> Self {
        self.router = Arc::new(router);
        self
    }
}

impl std::fmt::Debug for ChainOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainOptions")
            .field("listen_addr", &self.listen_addr)
            .field("proxy_url", &self.proxy_url)
            .field("verbosity", &self.verbosity)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("tls", &self.tls)
            .field("statistics", &self.statistics)
            .field("proxy_id", &self.proxy_id)
            .finish_non_exhaustive()
    }
}

/// A proxy that forwards every CONNECT tunnel and plain HTTP request it
/// receives through an upstream HTTP or SOCKS proxy.
pub struct ProxyChain {
    listen_addr: SocketAddr,
    tls: Option<TlsConfig>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<TrafficStats>,
    server: Option<ServerHandle>,
}

impl ProxyChain {
    /// Build a chain. A proxy URL that is present but unusable is an error;
    /// an absent one leaves every request to the router.
    pub fn new(options: ChainOptions) -> Result<Self, ChainError> {
        let default_descriptor = match options.proxy_url.as_deref() {
            Some(url) if !url.is_empty() => {
                let descriptor = derive_proxy_descriptor(
                    Some(url),
                    options.proxy_username.as_deref(),
                    options.proxy_password.as_deref(),
                )
                .ok_or_else(|| ChainError::Configuration(format!("unusable proxy URL '{url}'")))?;
                Some(Arc::new(descriptor))
            }
            _ => {
                warn!("no upstream proxy configured; requests depend on the router");
                None
            }
        };

        let stats = Arc::new(TrafficStats::new());
        let handler_config = HandlerConfig {
            verbosity: options.verbosity,
            connection_timeout: Some(options.connection_timeout).filter(|t| !t.is_zero()),
            idle_timeout: options.idle_timeout.filter(|t| !t.is_zero()),
            default_descriptor,
            router: options.router,
            proxy_id: options.proxy_id,
            statistics: options.statistics,
        };
        let dispatcher = Dispatcher::new(
            handler_config,
            options.statistics.then(|| Arc::clone(&stats)),
        );

        Ok(Self {
            listen_addr: options.listen_addr,
            tls: options.tls,
            dispatcher: Arc::new(dispatcher),
            stats,
            server: None,
        })
    }

    /// `Basic` Proxy-Authorization value for the credentials, or empty.
    pub fn make_auth(username: Option<&str>, password: Option<&str>) -> String {
        make_auth(username, password)
    }

    pub fn make_proxy_options(
        url: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Option<ProxyDescriptor> {
        derive_proxy_descriptor(url, username, password)
    }

    pub fn default_descriptor(&self) -> Option<&Arc<ProxyDescriptor>> {
        self.dispatcher.handler_config().default_descriptor.as_ref()
    }

    /// Start accepting connections. Calling it on a listening chain is a
    /// no-op that returns the bound address.
    pub async fn listen(&mut self) -> Result<SocketAddr, ChainError> {
        if let Some(server) = &self.server {
            return Ok(server.local_addr());
        }
        let tls = match &self.tls {
            Some(tls) => Some(create_tls_acceptor(&tls.cert_path, &tls.key_path)?),
            None => None,
        };
        let listener = create_listener(self.listen_addr)?;
        let server = server::spawn(listener, Arc::clone(&self.dispatcher), tls)?;
        let addr = server.local_addr();
        info!(
            "proxy chain listening on {}://{}",
            if self.tls.is_some() { "https" } else { "http" },
            addr
        );
        if let Some(descriptor) = self.default_descriptor() {
            info!(
                proxy_type = descriptor.proxy_type.as_str(),
                socks_version = descriptor.socks_version.map(|v| v.as_u8()),
                "forwarding through {}",
                descriptor
            );
        }
        self.server = Some(server);
        Ok(addr)
    }

    /// Stop accepting connections. Safe to call when not listening.
    pub async fn close(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.server.is_some()
    }

    /// Tunnel an already-read CONNECT request over `client`.
    ///
    /// `head` holds client bytes that followed the CONNECT head.
    pub async fn make_connection<S>(
        &self,
        request: ConnectRequest,
        client: S,
        head: &[u8],
    ) -> TunnelOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.dispatcher.make_connection(request, client, head).await
    }

    /// Forward a plain HTTP request and return the client response.
    pub async fn make_request<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        self.dispatcher.make_request(request).await
    }

    /// Receive every traffic sample. Only fed when statistics are enabled.
    pub fn subscribe(&self) -> broadcast::Receiver<TrafficSample> {
        self.stats.subscribe()
    }

    pub fn traffic(&self) -> TrafficTotals {
        self.stats.totals()
    }

    pub fn reset_traffic(&self) -> TrafficTotals {
        self.stats.reset()
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Handlers created by this chain that have not closed yet.
    pub fn active_handlers(&self) -> usize {
        self.dispatcher.active_handlers()
    }

    pub(crate) fn active_counter(&self) -> Arc<AtomicUsize> {
        self.dispatcher.active_counter()
    }

    pub fn statistics_enabled(&self) -> bool {
        self.dispatcher.handler_config().statistics
    }
}
