//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, latency, upstream connections)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `proxy_requests_total` (counter): exchanges by method, status, rule
//! - `proxy_request_duration_seconds` (histogram): exchange latency by rule
//! - `proxy_upstream_connections_total` (counter): connections by upstream and outcome
//! - `proxy_active_connections` (gauge): inbound connections currently open
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   embedders pay nothing when metrics are disabled
//! - Labels for rule and upstream, never for path (unbounded cardinality)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::routing::Upstream;

/// Install the Prometheus recorder and start its scrape listener on `address`.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;

    describe_counter!("proxy_requests_total", "Total number of forwarded exchanges");
    describe_histogram!(
        "proxy_request_duration_seconds",
        "Time from request receipt to response head, in seconds"
    );
    describe_counter!(
        "proxy_upstream_connections_total",
        "Upstream connections handed out, by outcome (new, reused, failed)"
    );
    describe_gauge!("proxy_active_connections", "Inbound connections currently open");

    tracing::info!(address = %address, "Metrics endpoint listening");
    Ok(())
}

/// Record one completed exchange.
pub fn record_request(method: &str, status: u16, rule: &str, started: Instant) {
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "rule" => rule.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "rule" => rule.to_string())
        .record(started.elapsed().as_secs_f64());
}

/// Record how an upstream connection was obtained.
pub fn record_upstream_connection(upstream: &Upstream, outcome: &'static str) {
    counter!(
        "proxy_upstream_connections_total",
        "upstream" => upstream.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn connection_opened() {
    gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("proxy_active_connections").decrement(1.0);
}
