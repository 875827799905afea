//! State and behaviour shared by the CONNECT and plain-request handlers.

use crate::error::ChainError;
use crate::handler::observer::{ByteCount, TrafficObserver};
use crate::options::ProxyDescriptor;
use crate::routing::{DefaultRouter, RequestRouter, RouteDecision};
use hyper::http::request::Parts;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound on a graceful stream shutdown during teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// How chatty handlers are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    Silent = 0,
    Warnings = 1,
    Trace = 2,
}

impl From<u8> for Verbosity {
    fn from(level: u8) -> Self {
        match level {
            0 => Verbosity::Silent,
            1 => Verbosity::Warnings,
            _ => Verbosity::Trace,
        }
    }
}

/// Which handler a lifecycle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Connection,
    Request,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Connection => "connect",
            HandlerKind::Request => "request",
        }
    }
}

/// Settings every handler of a chain is created with.
#[derive(Clone)]
pub struct HandlerConfig {
    pub verbosity: Verbosity,
    /// Time allowed for the upstream to produce a response; `None` disables it.
    pub connection_timeout: Option<Duration>,
    /// Socket inactivity limit for upstream sockets; `None` disables it.
    pub idle_timeout: Option<Duration>,
    pub default_descriptor: Option<Arc<ProxyDescriptor>>,
    pub router: Arc<dyn RequestRouter>,
    pub proxy_id: Option<String>,
    pub statistics: bool,
}

impl HandlerConfig {
    pub fn new(default_descriptor: Option<Arc<ProxyDescriptor>>) -> Self {
        Self {
            verbosity: Verbosity::Silent,
            connection_timeout: None,
            idle_timeout: None,
            default_descriptor,
            router: Arc::new(DefaultRouter),
            proxy_id: None,
            statistics: false,
        }
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("verbosity", &self.verbosity)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("default_descriptor", &self.default_descriptor)
            .field("proxy_id", &self.proxy_id)
            .field("statistics", &self.statistics)
            .finish_non_exhaustive()
    }
}

/// Flags and notification fan-out for one handler.
///
/// Shared between the handler and the stream/body wrappers it installs, so
/// that traffic counted deep inside an I/O adapter still reaches the
/// observer, and so that dropping the last wrapper can still close the
/// handler.
pub struct Lifecycle {
    kind: HandlerKind,
    closed: AtomicBool,
    error_sent: AtomicBool,
    proxy_id: RwLock<Option<Arc<str>>>,
    observer: Mutex<Option<Arc<dyn TrafficObserver>>>,
}

impl Lifecycle {
    pub fn new(kind: HandlerKind, proxy_id: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            closed: AtomicBool::new(false),
            error_sent: AtomicBool::new(false),
            proxy_id: RwLock::new(proxy_id.map(Arc::from)),
            observer: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Attach the observer receiving this handler's notifications.
    pub fn attach(&self, observer: Arc<dyn TrafficObserver>) {
        if !self.is_closed() {
            *self.observer.lock() = Some(observer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn error_sent(&self) -> bool {
        self.error_sent.load(Ordering::Acquire)
    }

    /// Claim the right to send the client an error response.
    ///
    /// Returns `true` exactly once per handler.
    pub fn claim_error(&self) -> bool {
        self.error_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn proxy_id(&self) -> Option<Arc<str>> {
        self.proxy_id.read().clone()
    }

    pub(crate) fn adopt_proxy_id(&self, proxy_id: &str) {
        *self.proxy_id.write() = Some(Arc::from(proxy_id));
    }

    /// Report client-to-upstream bytes.
    pub fn upload(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        if let Some(observer) = self.current_observer() {
            observer.on_upload(self.count(bytes));
        }
    }

    /// Report upstream-to-client bytes.
    pub fn download(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        if let Some(observer) = self.current_observer() {
            observer.on_download(self.count(bytes));
        }
    }

    /// Mark the handler closed, emit `on_close` and detach the observer.
    ///
    /// Returns `true` for the call that actually closed the handler.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        crate::metrics::record_handler_closed(self.kind.as_str());
        // Lock released before notifying.
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer.on_close();
        }
        true
    }

    fn current_observer(&self) -> Option<Arc<dyn TrafficObserver>> {
        self.observer.lock().clone()
    }

    fn count(&self, bytes: usize) -> ByteCount {
        ByteCount {
            proxy_id: self.proxy_id(),
            bytes: bytes as u64,
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .field("error_sent", &self.error_sent())
            .field("proxy_id", &self.proxy_id())
            .finish()
    }
}

/// Closes a lifecycle when dropped.
///
/// Handlers whose future may be dropped by the server (plain requests whose
/// client hangs up) hold one of these so teardown still happens.
#[derive(Debug)]
pub struct CloseGuard(Arc<Lifecycle>);

impl CloseGuard {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self(lifecycle)
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Routing, timeout and logging state common to both handlers.
pub struct HandlerBase {
    config: Arc<HandlerConfig>,
    lifecycle: Arc<Lifecycle>,
    descriptor: Option<Arc<ProxyDescriptor>>,
    deadline: Option<Instant>,
}

impl HandlerBase {
    pub fn new(kind: HandlerKind, config: Arc<HandlerConfig>) -> Self {
        let lifecycle = Lifecycle::new(kind, config.proxy_id.as_deref());
        crate::metrics::record_handler_started(kind.as_str());
        Self {
            config,
            lifecycle,
            descriptor: None,
            deadline: None,
        }
    }

    /// Route the request and arm the connection timeout.
    ///
    /// The chosen descriptor's proxy id, if any, replaces the configured one
    /// for every later notification.
    pub fn run(&mut self, request: &Parts) -> Result<Arc<ProxyDescriptor>, ChainError> {
        let decision = self
            .config
            .router
            .route(request, self.config.default_descriptor.as_ref());
        let descriptor = match decision {
            RouteDecision::Use(descriptor) => descriptor,
            RouteDecision::Reject => {
                self.warn_log(format_args!(
                    "no upstream proxy for {} {}",
                    request.method, request.uri
                ));
                return Err(ChainError::RoutingRejected);
            }
        };

        if let Some(proxy_id) = descriptor.proxy_id.as_deref() {
            self.lifecycle.adopt_proxy_id(proxy_id);
        }
        self.deadline = self
            .config
            .connection_timeout
            .map(|timeout| Instant::now() + timeout);
        self.debug_log(format_args!(
            "{} {} via {}",
            request.method, request.uri, descriptor
        ));
        self.descriptor = Some(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn descriptor(&self) -> Option<&Arc<ProxyDescriptor>> {
        self.descriptor.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the connection timeout once the upstream has answered.
    pub fn disarm_timeout(&mut self) {
        self.deadline = None;
    }

    pub fn debug_log(&self, args: fmt::Arguments<'_>) {
        if self.config.verbosity >= Verbosity::Trace {
            let proxy_id = self.lifecycle.proxy_id();
            debug!(
                handler = self.lifecycle.kind().as_str(),
                proxy_id = proxy_id.as_deref(),
                "{}",
                args
            );
        }
    }

    pub fn warn_log(&self, args: fmt::Arguments<'_>) {
        if self.config.verbosity >= Verbosity::Warnings {
            let proxy_id = self.lifecycle.proxy_id();
            warn!(
                handler = self.lifecycle.kind().as_str(),
                proxy_id = proxy_id.as_deref(),
                "{}",
                args
            );
        }
    }
}

/// Completes at `deadline`, or never when there is none.
pub async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Gracefully end and drop the stream held in `slot`.
///
/// Shutdown is bounded and its errors are only logged, so teardown can never
/// stall or fail the handler.
pub async fn close_stream<S>(slot: &mut Option<S>, label: &str)
where
    S: AsyncWrite + Unpin,
{
    let Some(mut stream) = slot.take() else {
        return;
    };
    match tokio::time::timeout(TEARDOWN_GRACE, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("{} shutdown failed: {}", label, e),
        Err(_) => debug!("{} shutdown timed out", label),
    }
}
