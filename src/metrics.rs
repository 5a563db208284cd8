//! Prometheus exposition for `GET /metrics`
//!
//! The recording helpers are plain `metrics` macro calls and cost nothing when
//! no recorder has been installed.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder. Call once per process.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!("edge_requests_total", "Edge requests by cache status");
    describe_counter!("edge_blocked_total", "Requests rejected by the filtering pipeline");
    describe_counter!("edge_bandwidth_bytes_total", "Response bytes served to clients");
    describe_histogram!("edge_origin_latency_seconds", "Origin round-trip time in seconds");
    describe_gauge!("edge_websocket_tunnels", "Live WebSocket tunnels");
    describe_counter!("edge_certificates_provisioned_total", "Certificates provisioned by method");

    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// `status` is HIT, MISS or BYPASS
pub fn record_request(hostname: &str, status: &'static str) {
    counter!("edge_requests_total", "domain" => hostname.to_string(), "cache" => status).increment(1);
}

pub fn record_block(reason: &str) {
    counter!("edge_blocked_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_bandwidth(bytes: u64) {
    counter!("edge_bandwidth_bytes_total").increment(bytes);
}

pub fn record_origin_latency(seconds: f64) {
    histogram!("edge_origin_latency_seconds").record(seconds);
}

pub fn set_active_tunnels(count: usize) {
    gauge!("edge_websocket_tunnels").set(count as f64);
}

pub fn record_certificate(method: &'static str) {
    counter!("edge_certificates_provisioned_total", "method" => method).increment(1);
}
