//! Metrics collection and exposition.
//!
//! # Metrics
//! - `media_tap_connections_total` (counter): routed connections by protocol
//! - `media_tap_requests_total` (counter): proxied requests by path, status
//! - `media_tap_request_duration_seconds` (histogram): time to response headers
//! - `media_tap_captures_total` (counter): capture outcomes
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are low-cardinality (no URLs or hosts)

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

use crate::net::sniff::Protocol;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection(protocol: Protocol) {
    counter!("media_tap_connections_total", "protocol" => protocol.as_str()).increment(1);
}

/// `path` is `"plain"` or `"secure"`.
pub fn record_request(path: &'static str, status: u16, start: Instant) {
    counter!(
        "media_tap_requests_total",
        "path" => path,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("media_tap_request_duration_seconds", "path" => path)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_capture(outcome: &'static str) {
    counter!("media_tap_captures_total", "outcome" => outcome).increment(1);
}
