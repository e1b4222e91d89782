//! Operational endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tenancy::{ConnectionFactory, DirectoryLookup, RegistryStats};

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub open_connections: usize,
    pub pending_inits: usize,
}

/// GET /health — liveness plus registry occupancy.
pub async fn health<D, F>(State(state): State<Arc<AppState<D, F>>>) -> Json<HealthResponse>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    let stats = state.registry.stats().await;
    Json(HealthResponse {
        status: "ok",
        open_connections: stats.total_connections,
        pending_inits: stats.pending_inits,
    })
}

/// GET /registry/stats — per-entry registry snapshot.
pub async fn registry_stats<D, F>(State(state): State<Arc<AppState<D, F>>>) -> Json<RegistryStats>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    Json(state.registry.stats().await)
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
