//! Prometheus metrics for CloudShim.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, and provides the `"metrics"` registry
//! middleware recording HTTP RED metrics per tenant.  When `metrics_port`
//! is configured, a small loopback listener serves `GET /metrics`.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "cloudshim_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cloudshim_http_request_duration_seconds";

/// Supervisor reconfiguration passes (counter).
pub const RECONFIG_PASSES_TOTAL: &str = "cloudshim_reconfig_passes_total";

/// Router swaps performed by the supervisor (counter).
pub const ROUTER_SWAPS_TOTAL: &str = "cloudshim_router_swaps_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to
/// call multiple times (e.g. in tests). Returns the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(RECONFIG_PASSES_TOTAL, "Supervisor reconfiguration passes");
    describe_counter!(ROUTER_SWAPS_TOTAL, "Tenant router hot-swaps");
}

// -- Metrics middleware -------------------------------------------------------

/// Registry middleware recording RED metrics for every tenant request.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Collapse request paths to route templates so bucket and key names do
/// not explode label cardinality.
fn normalize_path(path: &str) -> String {
    let segments = path.trim_matches('/').split('/').filter(|s| !s.is_empty());
    match segments.count() {
        0 => "/".to_string(),
        1 => "/:bucket".to_string(),
        _ => "/:bucket/*key".to_string(),
    }
}

// -- Scrape endpoint ----------------------------------------------------------

/// Serve `GET /metrics` on a dedicated loopback port.
pub async fn serve_metrics(port: u16) -> anyhow::Result<()> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("metrics listening on 127.0.0.1:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/b1"), "/:bucket");
        assert_eq!(normalize_path("/b1/"), "/:bucket");
        assert_eq!(normalize_path("/b1/deep/nested/key"), "/:bucket/*key");
    }
}
