//! Prometheus metrics plumbing shared by the binaries.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and attach a `/metrics` route plus the
/// request-tracking middleware to the given router. Call once per process.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Buckets sized for both sub-second HTTP handling and multi-second
    // webhook deliveries.
    const SECONDS: &[f64] = &[
        0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(SECONDS)
        .expect("non-empty bucket list")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Middleware recording request counts and latencies per route and status.
pub async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("render_http_requests_total", &labels).increment(1);
    metrics::histogram!("render_http_request_duration_seconds", &labels).record(latency);

    response
}
