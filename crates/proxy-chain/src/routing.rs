//! Per-request upstream selection.
//!
//! A router sees the head of every proxied request (CONNECT or plain) and
//! decides which upstream proxy carries it, or refuses it outright.

use crate::options::ProxyDescriptor;
use hyper::http::request::Parts;
use std::fmt;
use std::sync::Arc;

/// Outcome of routing a single request.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Forward through this upstream proxy.
    Use(Arc<ProxyDescriptor>),
    /// Refuse the request; the client receives a connection error.
    Reject,
}

impl RouteDecision {
    pub fn is_reject(&self) -> bool {
        matches!(self, RouteDecision::Reject)
    }
}

/// Chooses the upstream proxy for a request.
///
/// `default` is the descriptor derived from the chain's configured proxy URL,
/// if there is one.
pub trait RequestRouter: Send + Sync {
    fn route(&self, request: &Parts, default: Option<&Arc<ProxyDescriptor>>) -> RouteDecision;
}

impl<F> RequestRouter for F
where
    F: Fn(&Parts, Option<&Arc<ProxyDescriptor>>) -> RouteDecision + Send + Sync,
{
    fn route(&self, request: &Parts, default: Option<&Arc<ProxyDescriptor>>) -> RouteDecision {
        self(request, default)
    }
}

/// Sends everything to the default proxy; rejects when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouter;

impl RequestRouter for DefaultRouter {
    fn route(&self, _request: &Parts, default: Option<&Arc<ProxyDescriptor>>) -> RouteDecision {
        match default {
            Some(descriptor) => RouteDecision::Use(Arc::clone(descriptor)),
            None => RouteDecision::Reject,
        }
    }
}

impl fmt::Debug for dyn RequestRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestRouter")
    }
}
