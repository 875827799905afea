//! Traffic notifications emitted by handlers.

use std::sync::Arc;

/// Bytes moved in one direction, tagged with the proxy that carried them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCount {
    pub proxy_id: Option<Arc<str>>,
    pub bytes: u64,
}

/// Receives traffic and lifecycle notifications from a single handler.
///
/// Upload is client-to-upstream traffic, download is upstream-to-client.
/// `on_close` fires at most once, after which the handler stops notifying.
pub trait TrafficObserver: Send + Sync {
    fn on_upload(&self, count: ByteCount);

    fn on_download(&self, count: ByteCount);

    fn on_close(&self) {}
}
