//! Metrics endpoint served next to the consumer.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use bookingprocessor_observability::{ConsumerMetrics, MetricsSnapshot};

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

/// `/health`, `/metrics` (Prometheus text) and `/stats` (JSON snapshot).
pub fn router(metrics: Arc<ConsumerMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus))
        .route("/stats", get(stats))
        .with_state(metrics)
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn prometheus(State(metrics): State<Arc<ConsumerMetrics>>) -> Response {
    match metrics.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to gather metrics: {e}"),
        )
            .into_response(),
    }
}

async fn stats(State(metrics): State<Arc<ConsumerMetrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
