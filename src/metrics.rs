use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};

use crate::proxy::http::codec::read_request_head;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Gateway request latency")
        .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register request_duration_seconds");
    histogram
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Cache entries persisted")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Cache persistence failures")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_READ_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_read_errors_total",
        "Cache reads that failed and fell back to the origin",
    )
    .expect("create cache_read_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_read_errors_total");
    counter
});

static ORIGIN_FETCH_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("origin_fetch_total", "Origin fetches started")
        .expect("create origin_fetch_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register origin_fetch_total");
    counter
});

static ORIGIN_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("origin_errors_total", "Origin fetch failures by cause"),
        &["cause"],
    )
    .expect("create origin_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_errors_total");
    vec
});

static COALESCED_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "coalesced_misses_total",
        "Misses answered by another request's origin fetch",
    )
    .expect("create coalesced_misses_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register coalesced_misses_total");
    counter
});

static INFLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("inflight_requests", "Current inflight requests").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_requests");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_PATH: &str = "/metrics";

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn inc_inflight() {
    INFLIGHT_REQUESTS.inc();
}

pub fn dec_inflight() {
    INFLIGHT_REQUESTS.dec();
}

pub fn record_request(status: StatusCode, elapsed: Duration) {
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_read_error() {
    CACHE_READ_ERRORS_TOTAL.inc();
}

pub fn record_origin_fetch() {
    ORIGIN_FETCH_TOTAL.inc();
}

pub fn record_origin_error(cause: &str) {
    ORIGIN_ERRORS_TOTAL.with_label_values(&[cause]).inc();
}

pub fn record_coalesced_miss() {
    COALESCED_MISSES_TOTAL.inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serve the text exposition format on `GET /metrics`.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener).await
}

pub async fn serve_listener(listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, peer, METRICS_PATH).await {
                tracing::debug!(peer = %peer, error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, peer: SocketAddr, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handle_stream_with_limits(
        stream,
        peer,
        path,
        METRICS_READ_TIMEOUT,
        METRICS_MAX_REQUEST_BYTES,
    )
    .await
}

async fn handle_stream_with_limits<S>(
    stream: S,
    peer: SocketAddr,
    path: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(head) = read_request_head(&mut reader, peer, read_timeout, max_bytes).await? else {
        return Ok(());
    };

    let response = if head.method == Method::GET && head.target == path {
        let body = gather();
        build_response(200, TextEncoder::new().format_type(), body)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
