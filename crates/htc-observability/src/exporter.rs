//! Prometheus text exporter
//!
//! Serves `/metrics` and `/health` for scraping; mounted by the CLI on the
//! metrics port.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::error;

use crate::metrics::ControllerMetrics;

async fn metrics_handler(State(metrics): State<ControllerMetrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = metrics.registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("failed to encode metrics: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encoding error: {e}"))
            .into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Router serving the metrics and health endpoints.
pub fn metrics_router(metrics: ControllerMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_encodes_registered_metrics() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.reconciliations_total.inc();
        let response = metrics_handler(State(metrics)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn router_builds() {
        let metrics = ControllerMetrics::new().unwrap();
        let _router = metrics_router(metrics);
    }
}
