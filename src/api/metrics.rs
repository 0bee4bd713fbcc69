//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! Domain counters are recorded through the `record_*` helpers from the
//! tenant resolver, issuance workflow and proxy routes.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const SALES_TOTAL: &str = "sales_total";
pub const TENANT_RESOLUTIONS_TOTAL: &str = "tenant_resolutions_total";
pub const PROXY_REQUESTS_TOTAL: &str = "proxy_requests_total";

/// Install the Prometheus recorder. Call once during startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        SALES_TOTAL,
        "Issuance attempts by outcome (completed/failed/tenant_changed)"
    );
    describe_counter!(
        TENANT_RESOLUTIONS_TOTAL,
        "Tenant resolutions by source (cache/backend/unprovisioned)"
    );
    describe_counter!(
        PROXY_REQUESTS_TOTAL,
        "Proxy route calls by route and response status"
    );

    Ok(handle)
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records `http_requests_total` and `http_request_duration_seconds` per
/// method and matched path.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Matched path keeps CPFs and event slugs out of the label set
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Record the outcome of an issuance attempt.
pub fn record_sale(outcome: &'static str) {
    counter!(SALES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record where a tenant binding came from.
pub fn record_tenant_resolution(source: &'static str) {
    counter!(TENANT_RESOLUTIONS_TOTAL, "source" => source).increment(1);
}

pub fn record_proxy_request(route: &'static str, status: u16) {
    counter!(PROXY_REQUESTS_TOTAL, "route" => route, "status" => status.to_string()).increment(1);
}
