//! Traffic aggregation across all handlers of a chain.

use crate::handler::{ByteCount, TrafficObserver};
use crate::metrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

/// One observed chunk of traffic. Exactly one of the byte fields is non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl TrafficSample {
    pub fn upload(count: ByteCount) -> Self {
        Self {
            proxy_id: count.proxy_id.map(|id| id.to_string()),
            upload_bytes: count.bytes,
            download_bytes: 0,
        }
    }

    pub fn download(count: ByteCount) -> Self {
        Self {
            proxy_id: count.proxy_id.map(|id| id.to_string()),
            upload_bytes: 0,
            download_bytes: count.bytes,
        }
    }
}

/// Running totals since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTotals {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Process-wide traffic counters plus a broadcast of every sample.
#[derive(Debug)]
pub struct TrafficStats {
    upload: AtomicU64,
    download: AtomicU64,
    samples: broadcast::Sender<TrafficSample>,
}

impl TrafficStats {
    pub fn new() -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            samples,
        }
    }

    pub fn record(&self, sample: TrafficSample) {
        if sample.upload_bytes > 0 {
            self.upload.fetch_add(sample.upload_bytes, Ordering::Relaxed);
            metrics::record_traffic("upload", sample.upload_bytes);
        }
        if sample.download_bytes > 0 {
            self.download.fetch_add(sample.download_bytes, Ordering::Relaxed);
            metrics::record_traffic("download", sample.download_bytes);
        }
        // No subscribers is fine.
        let _ = self.samples.send(sample);
    }

    pub fn totals(&self) -> TrafficTotals {
        TrafficTotals {
            upload_bytes: self.upload.load(Ordering::Relaxed),
            download_bytes: self.download.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters, returning what they held.
    pub fn reset(&self) -> TrafficTotals {
        TrafficTotals {
            upload_bytes: self.upload.swap(0, Ordering::Relaxed),
            download_bytes: self.download.swap(0, Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrafficSample> {
        self.samples.subscribe()
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Attached to every handler the chain creates.
///
/// Always tracks the number of open handlers; forwards traffic to the
/// aggregator only when statistics are enabled.
pub(crate) struct ChainObserver {
    stats: Option<Arc<TrafficStats>>,
    active: Arc<AtomicUsize>,
}

impl ChainObserver {
    pub(crate) fn new(stats: Option<Arc<TrafficStats>>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self { stats, active }
    }
}

impl TrafficObserver for ChainObserver {
    fn on_upload(&self, count: ByteCount) {
        if let Some(stats) = &self.stats {
            stats.record(TrafficSample::upload(count));
        }
    }

    fn on_download(&self, count: ByteCount) {
        if let Some(stats) = &self.stats {
            stats.record(TrafficSample::download(count));
        }
    }

    fn on_close(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
