//! Per-request handlers.
//!
//! - [`ConnectionHandler`] owns a CONNECT tunnel end to end
//! - [`RequestHandler`] forwards one plain HTTP request
//!
//! Both share [`HandlerBase`] for routing, the connection timeout and
//! single-fire error/close bookkeeping.

mod base;
mod connection;
mod connector;
mod io;
mod observer;
mod request;
mod socks;

pub use base::{HandlerBase, HandlerConfig, HandlerKind, Lifecycle, Verbosity};
pub use connection::{ConnectRequest, ConnectionHandler, TunnelOutcome, TunnelState};
pub use connector::{connect_request, HttpConnector, TunnelResult};
pub use io::PrefixedStream;
pub use observer::{ByteCount, TrafficObserver};
pub use request::{error_response, estimate_request_head, ProxyBody, RequestHandler};
pub use socks::split_target;

#[cfg(test)]
pub(crate) use observer::testing;
