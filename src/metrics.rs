//! Prometheus metrics registry (A.5). Same `prometheus` dependency and
//! `Lazy`-static-registration idiom the teacher uses in `plugin/prometheus.rs`,
//! generalized from per-proxy-request counters to the request-servicing
//! pipeline's own counters and the render-latency histogram.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};
use once_cell::sync::Lazy;
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

use crate::orchestrator::GatewayState;

const LATENCY_BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

pub static CACHE_HITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("cache_hits_total", "Cache hits served locally or via pull", &["host_id"]).unwrap()
});

pub static CACHE_MISSES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("cache_misses_total", "Cache misses across all owners", &["host_id"]).unwrap()
});

pub static RENDERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("renders_total", "Completed render dispatches", &["host_id", "outcome"]).unwrap()
});

pub static BYPASS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("bypass_total", "Direct origin fetches", &["host_id", "outcome"]).unwrap()
});

pub static STALE_SERVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("stale_served_total", "Stale cache entries served during in-flight render", &["host_id"]).unwrap()
});

pub static RECACHE_SCHEDULED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("recache_scheduled_total", "Recache entries popped off a priority queue", &["host_id", "priority"]).unwrap()
});

pub static RECACHE_FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("recache_failed_total", "Recache attempts dropped after exhausting retries", &["host_id"]).unwrap()
});

pub static LOCK_WAIT_TIMEOUTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("lock_wait_timeouts_total", "Wait-on-cache timeouts that fell through to bypass", &["host_id"]).unwrap()
});

pub static DECOMPRESSION_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("decompression_errors_total", "Cache blobs that failed to decompress", &["host_id"]).unwrap()
});

pub static RENDER_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "render_latency_ms",
        "Render-service round-trip latency in milliseconds",
        &["host_id"],
        LATENCY_BUCKETS.to_vec()
    )
    .unwrap()
});

/// Render the default registry as Prometheus text exposition format.
pub fn encode_text() -> Vec<u8> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("failed to encode metrics: {e}");
    }
    buffer
}

/// `/metrics` exposition plus a readiness probe, on the separate `Status`
/// listener (§9 Non-goal: metrics exposition is ambient plumbing, not core
/// logic). Grounded on the teacher's `service/status.rs` `ServeHttp` app —
/// same shape, with the readiness check delegated to the directory ping
/// this crate already uses for `/ready` on the main listener.
pub struct StatusHttpApp {
    state: Arc<GatewayState>,
}

impl StatusHttpApp {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        session.set_keepalive(None);
        match session.req_header().uri.path() {
            "/metrics" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(encode_text())
                .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")),
            "/status/ready" => {
                let ready = self.state.directory.ping().await.is_ok();
                let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
                plain(status, if ready { "ok" } else { "not ready" })
            }
            _ => plain(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn plain(status: StatusCode, body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .body(body.as_bytes().to_vec())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(b"Internal Server Error".to_vec())
                .unwrap()
        })
}
