//! Prometheus metrics for proxy-chain.
//!
//! Tracks handler lifecycles, failures by status code, and relayed bytes.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, CounterVec, Encoder,
    GaugeVec, IntCounter, TextEncoder,
};

lazy_static! {
    /// Handlers created, by kind (connect|request)
    pub static ref HANDLERS_STARTED_TOTAL: CounterVec = register_counter_vec!(
        "proxy_chain_handlers_started_total",
        "Total number of handlers created by the chain",
        &["kind"]
    )
    .expect("metric can be registered");

    /// Handlers currently open
    pub static ref ACTIVE_HANDLERS: GaugeVec = register_gauge_vec!(
        "proxy_chain_active_handlers",
        "Number of handlers that have not closed yet",
        &["kind"]
    )
    .expect("metric can be registered");

    /// Error statuses sent to clients
    pub static ref HANDLER_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "proxy_chain_handler_failures_total",
        "Total number of error responses sent to clients",
        &["kind", "status"]
    )
    .expect("metric can be registered");

    /// CONNECT tunnels that reached the splicing phase
    pub static ref TUNNELS_ESTABLISHED_TOTAL: IntCounter = register_int_counter!(
        "proxy_chain_tunnels_established_total",
        "Total number of CONNECT tunnels established through the upstream"
    )
    .expect("metric can be registered");

    /// Relayed bytes, by direction (upload|download)
    pub static ref TRAFFIC_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "proxy_chain_traffic_bytes_total",
        "Total bytes relayed while statistics are enabled",
        &["direction"]
    )
    .expect("metric can be registered");
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_handler_started(kind: &str) {
    HANDLERS_STARTED_TOTAL.with_label_values(&[kind]).inc();
    ACTIVE_HANDLERS.with_label_values(&[kind]).inc();
}

pub fn record_handler_closed(kind: &str) {
    ACTIVE_HANDLERS.with_label_values(&[kind]).dec();
}

/// Helper to record an error status sent to a client
pub fn record_handler_failure(kind: &str, status: u16) {
    HANDLER_FAILURES_TOTAL
        .with_label_values(&[kind, &status.to_string()])
        .inc();
}

pub fn record_tunnel_established() {
    TUNNELS_ESTABLISHED_TOTAL.inc();
}

pub fn record_traffic(direction: &str, bytes: u64) {
    TRAFFIC_BYTES_TOTAL
        .with_label_values(&[direction])
        .inc_by(bytes as f64);
}
