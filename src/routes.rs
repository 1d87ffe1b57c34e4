//! Health and metrics routes, served outside the pipeline.

use axum::{Json, Router, routing::get};
use gateway_telemetry::PrometheusHandle;
use serde::Serialize;

use crate::middleware::StageName;

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    stages: Vec<&'static str>,
}

/// Build version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health routes reporting the active `stages`.
pub fn health_routes(stages: &[StageName]) -> Router {
    let stages: Vec<&'static str> = stages.iter().map(|stage| stage.as_str()).collect();

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/health/live", get(|| async { "OK" }))
        .route(
            "/health/ready",
            get(move || {
                let stages = stages.clone();
                async move {
                    Json(HealthResponse {
                        status: "healthy",
                        version: VERSION,
                        stages,
                    })
                }
            }),
        )
}

/// Health routes with the Prometheus metrics endpoint.
pub fn health_routes_with_metrics(stages: &[StageName], metrics_handle: PrometheusHandle) -> Router {
    health_routes(stages).route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }),
    )
}
