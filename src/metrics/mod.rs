//! Prometheus metrics exposition.
//!
//! The core reports through the narrow helpers below; the exporter serves
//! `/metrics` on its own listener so scraping never touches the proxy port.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus recorder")?;

    info!("metrics listening on http://{}/metrics", addr);
    Ok(())
}

/// Update the health gauge for a backend (1 = healthy, 0 = unhealthy).
pub fn update_backend_health(backend: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    gauge!("golem_backend_health", "backend" => backend.to_string()).set(value);
}

/// Update the active-connections gauge for a backend.
pub fn update_active_connections(backend: &str, count: u32) {
    gauge!("golem_active_connections", "backend" => backend.to_string()).set(count as f64);
}

/// Record a completed request: counter by (backend, method, status) plus the
/// duration histogram.
pub fn record_request(backend: &str, method: &str, status: u16, duration: Duration) {
    let labels = [
        ("backend", backend.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("golem_requests_total", &labels).increment(1);

    histogram!(
        "golem_request_duration_seconds",
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Publish static build/configuration info.
pub fn set_balancer_info(version: &str, method: &str) {
    gauge!(
        "golem_info",
        "version" => version.to_string(),
        "method" => method.to_string()
    )
    .set(1.0);
}
