//! Route dispatch for the admin endpoint.

use crate::chain::{ProxyChain, TrafficStats, TrafficTotals};
use crate::metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the admin endpoint can see of a running chain.
#[derive(Clone)]
pub struct AdminState {
    stats: Arc<TrafficStats>,
    active: Arc<AtomicUsize>,
    statistics: bool,
}

impl AdminState {
    pub fn new(chain: &ProxyChain) -> Self {
        Self {
            stats: Arc::clone(chain.stats()),
            active: chain.active_counter(),
            statistics: chain.statistics_enabled(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(flatten)]
    totals: TrafficTotals,
    active_handlers: usize,
    statistics: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

pub async fn route_request<B>(
    req: Request<B>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("Admin: {} {}", method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),
        (&Method::GET, "/metrics") => metrics_response(),
        (&Method::GET, "/stats") => stats_response(&state, state.stats.totals()),
        (&Method::POST, "/stats/reset") => stats_response(&state, state.stats.reset()),
        (_, "/health" | "/metrics" | "/stats" | "/stats/reset") => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

fn stats_response(state: &AdminState, totals: TrafficTotals) -> Response<Full<Bytes>> {
    let body = StatsResponse {
        totals,
        active_handlers: state.active.load(Ordering::Acquire),
        statistics: state.statistics,
    };
    json_response(StatusCode::OK, &body)
}

fn metrics_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(metrics::collect_metrics())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorResponse { error: message })
}
