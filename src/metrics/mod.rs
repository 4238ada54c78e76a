//! Prometheus metrics for the strata proxy

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Query metrics
    /// Completed queries by statement type
    pub queries_total: IntCounterVec,
    /// Query latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
    /// Failed queries by error kind
    pub query_errors_total: IntCounterVec,
    /// Rows streamed to clients
    pub rows_returned_total: IntCounter,
    /// Bytes sent to clients
    pub bytes_sent_total: IntCounter,

    // Backend metrics
    /// Backend connection lifecycle events
    pub backend_connections_total: IntCounterVec,
    /// Backend reads paused by flow control
    pub flow_control_pauses_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("strata_queries_total", "Total number of completed queries"),
            &["type"], // select, insert, update, delete, etc.
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new("strata_query_duration_seconds", "Query latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0,
                ]),
            &["type", "user"],
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("strata_query_errors_total", "Total number of failed queries"),
            &["kind"], // connect, backend, closed
        )
        .unwrap();

        let rows_returned_total = IntCounter::new(
            "strata_rows_returned_total",
            "Total number of result rows returned to clients",
        )
        .unwrap();

        let bytes_sent_total = IntCounter::new(
            "strata_bytes_sent_total",
            "Total number of result bytes returned to clients",
        )
        .unwrap();

        let backend_connections_total = IntCounterVec::new(
            Opts::new(
                "strata_backend_connections_total",
                "Backend connection events",
            ),
            &["event"], // created, acquired, released, closed
        )
        .unwrap();

        let flow_control_pauses_total = IntCounter::new(
            "strata_flow_control_pauses_total",
            "Total number of backend read pauses caused by client backpressure",
        )
        .unwrap();

        registry.register(Box::new(queries_total.clone())).unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(rows_returned_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bytes_sent_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backend_connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(flow_control_pauses_total.clone()))
            .unwrap();

        Self {
            registry,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            rows_returned_total,
            bytes_sent_total,
            backend_connections_total,
            flow_control_pauses_total,
        }
    }

    /// Record a completed query
    pub fn record_query(&self, query_type: &str, user: &str, duration_secs: f64, rows: u64, bytes: u64) {
        self.queries_total.with_label_values(&[query_type]).inc();
        self.query_duration_seconds
            .with_label_values(&[query_type, user])
            .observe(duration_secs);
        self.rows_returned_total.inc_by(rows);
        self.bytes_sent_total.inc_by(bytes);
    }

    /// Record a query error
    pub fn record_query_error(&self, kind: &str) {
        self.query_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_backend_connection(&self, event: &str) {
        self.backend_connections_total
            .with_label_values(&[event])
            .inc();
    }

    pub fn record_flow_control_pause(&self) {
        self.flow_control_pauses_total.inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
