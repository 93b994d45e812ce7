//! Prometheus metrics for the caching layer
//!
//! Counters for cache effectiveness and upstream load, a latency histogram
//! for upstream requests, and a gauge tracking index size per collection.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Cache ===

    /// Cache lookups by kind (block, recent) and outcome (hit, miss, error)
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = register_counter_vec!(
        "mcache_cache_lookups_total",
        "Cache lookups by kind and outcome",
        &["kind", "outcome"]
    ).unwrap();

    /// Cache stores by kind and status (stored, skipped_failed, error)
    pub static ref CACHE_STORES_TOTAL: CounterVec = register_counter_vec!(
        "mcache_cache_stores_total",
        "Cache stores by kind and status",
        &["kind", "status"]
    ).unwrap();

    // === Upstream ===

    /// Upstream requests by type and status
    pub static ref UPSTREAM_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mcache_upstream_requests_total",
        "Requests sent to the time-series service",
        &["request", "status"]
    ).unwrap();

    /// Sub-ranges the upstream reported as timed out
    pub static ref UPSTREAM_TIMEOUTS_TOTAL: CounterVec = register_counter_vec!(
        "mcache_upstream_query_timeouts_total",
        "Query cancellations reported by the time-series service",
        &["collection"]
    ).unwrap();

    /// Upstream request latency
    pub static ref UPSTREAM_DURATION: HistogramVec = register_histogram_vec!(
        "mcache_upstream_request_duration_seconds",
        "Upstream request latency in seconds",
        &["request"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    // === Index ===

    /// Streams currently indexed per collection
    pub static ref INDEXED_STREAMS: GaugeVec = register_gauge_vec!(
        "mcache_indexed_streams",
        "Streams present in each collection's index",
        &["collection"]
    ).unwrap();

    /// Streams rejected during index refresh
    pub static ref STREAM_INSERT_FAILURES: CounterVec = register_counter_vec!(
        "mcache_stream_insert_failures_total",
        "Streams skipped while refreshing an index",
        &["collection"]
    ).unwrap();

    // === Health ===

    /// Health status (1 = healthy)
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "mcache_health_status",
        "Health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Initialize metrics
///
/// Forces registration of every metric and marks the process healthy.
pub fn init() {
    HEALTH_STATUS.set(1.0);
    lazy_static::initialize(&CACHE_LOOKUPS_TOTAL);
    lazy_static::initialize(&CACHE_STORES_TOTAL);
    lazy_static::initialize(&UPSTREAM_REQUESTS_TOTAL);
    lazy_static::initialize(&UPSTREAM_TIMEOUTS_TOTAL);
    lazy_static::initialize(&UPSTREAM_DURATION);
    lazy_static::initialize(&INDEXED_STREAMS);
    lazy_static::initialize(&STREAM_INSERT_FAILURES);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a cache lookup
#[inline]
pub fn record_cache_lookup(kind: &str, outcome: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

/// Record a cache store attempt
#[inline]
pub fn record_cache_store(kind: &str, status: &str) {
    CACHE_STORES_TOTAL.with_label_values(&[kind, status]).inc();
}

/// Record an upstream request
#[inline]
pub fn record_upstream_request(request: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    UPSTREAM_REQUESTS_TOTAL
        .with_label_values(&[request, status])
        .inc();

    UPSTREAM_DURATION
        .with_label_values(&[request])
        .observe(duration_secs);
}

/// Record an upstream query cancellation
#[inline]
pub fn record_upstream_timeout(collection: &str) {
    UPSTREAM_TIMEOUTS_TOTAL.with_label_values(&[collection]).inc();
}

/// Record a stream that could not be indexed
#[inline]
pub fn record_stream_insert_failure(collection: &str) {
    STREAM_INSERT_FAILURES.with_label_values(&[collection]).inc();
}

/// Update the indexed stream count for a collection
#[inline]
pub fn update_indexed_streams(collection: &str, count: usize) {
    INDEXED_STREAMS
        .with_label_values(&[collection])
        .set(count as f64);
}
