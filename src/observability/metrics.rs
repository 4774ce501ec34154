//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_flows_total` (counter): flows started, by kind (`web`/`ws`)
//! - `proxy_flow_duration_seconds` (histogram): time until upstream headers
//! - `proxy_upstream_errors_total` (counter): failed flows, by error kind
//! - `proxy_redirects_followed_total` (counter): redirect hops taken
//! - `proxy_tunnels_total` (counter): tunnels, by result
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed by [`init_metrics`]
//! - Labels stay low-cardinality: no hosts, no paths

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Serve a Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_flow_started(kind: &'static str) {
    counter!("proxy_flows_total", "kind" => kind).increment(1);
}

pub fn record_upstream_response(kind: &'static str, start: Instant) {
    histogram!("proxy_flow_duration_seconds", "kind" => kind).record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error(error_kind: &'static str) {
    counter!("proxy_upstream_errors_total", "error" => error_kind).increment(1);
}

pub fn record_redirect_followed(status: u16) {
    counter!("proxy_redirects_followed_total", "status" => status.to_string()).increment(1);
}

pub fn record_tunnel(result: &'static str) {
    counter!("proxy_tunnels_total", "result" => result).increment(1);
}
