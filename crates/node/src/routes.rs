//! Ops endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::NodeInfo;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub partitions: u32,
    pub workers_per_topic: usize,
}

/// GET /health
pub async fn health(State(node): State<Arc<NodeInfo>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: node.backend.as_str(),
        partitions: node.partitions,
        workers_per_topic: node.workers_per_topic,
    })
}

/// GET /metrics, in Prometheus text format.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
