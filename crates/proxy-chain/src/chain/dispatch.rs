//! Turns inbound interactions into handlers.

use crate::chain::stats::{ChainObserver, TrafficStats};
use crate::error::ChainError;
use crate::handler::{
    error_response, ConnectRequest, ConnectionHandler, HandlerConfig, Lifecycle, ProxyBody,
    RequestHandler, TunnelOutcome, Verbosity,
};
use bytes::Bytes;
use hyper::body::Body;
use hyper::{Request, Response, Uri};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared by the accept loop and the public `ProxyChain` entry points.
pub(crate) struct Dispatcher {
    handler_config: Arc<HandlerConfig>,
    stats: Option<Arc<TrafficStats>>,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub(crate) fn new(handler_config: HandlerConfig, stats: Option<Arc<TrafficStats>>) -> Self {
        Self {
            handler_config: Arc::new(handler_config),
            stats,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn handler_config(&self) -> &HandlerConfig {
        &self.handler_config
    }

    pub(crate) fn active_handlers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn active_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    fn observe(&self, lifecycle: &Lifecycle) {
        let observer = ChainObserver::new(self.stats.clone(), Arc::clone(&self.active));
        lifecycle.attach(Arc::new(observer));
    }

    /// Run a CONNECT tunnel to completion.
    pub(crate) async fn make_connection<S>(
        &self,
        request: ConnectRequest,
        client: S,
        head: &[u8],
    ) -> TunnelOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.handler_config.verbosity >= Verbosity::Trace {
            debug!("-> CONNECT {}", request.target);
        }
        let handler =
            ConnectionHandler::new(Arc::clone(&self.handler_config), request, client, head);
        self.observe(handler.lifecycle());
        handler.run().await
    }

    /// Forward a plain HTTP request.
    pub(crate) async fn make_request<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        if self.handler_config.verbosity >= Verbosity::Trace {
            debug!("-> HTTP {} {}", request.method(), request.uri());
        }
        if let Err(e) = check_request_target(request.uri()) {
            if self.handler_config.verbosity >= Verbosity::Trace {
                debug!("refusing request: {}", e);
            }
            return error_response(400, "Bad Request");
        }

        let handler = RequestHandler::new(Arc::clone(&self.handler_config));
        self.observe(handler.lifecycle());
        handler.run(request).await
    }
}

/// Plain requests must be absolute-form and not https.
pub(crate) fn check_request_target(uri: &Uri) -> Result<(), ChainError> {
    match uri.scheme_str() {
        None => Err(ChainError::BadRequest(format!(
            "request target {uri} is not an absolute URL"
        ))),
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => Err(ChainError::BadRequest(
            "https requests must be tunnelled with CONNECT".to_string(),
        )),
        Some(_) if uri.host().is_none() => Err(ChainError::BadRequest(format!(
            "request target {uri} has no host"
        ))),
        Some(_) => Ok(()),
    }
}
