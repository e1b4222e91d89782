//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use tenancy::{InMemoryConnectionFactory, InMemoryDirectory, RegistryConfig, TenantRegistry};
use tower::ServiceExt;

type Registry = TenantRegistry<InMemoryDirectory, InMemoryConnectionFactory>;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, Registry, InMemoryDirectory) {
    let directory = InMemoryDirectory::new();
    let registry = TenantRegistry::new(
        directory.clone(),
        InMemoryConnectionFactory::new(),
        RegistryConfig::default(),
    );
    let state = Arc::new(AppState {
        registry: registry.clone(),
    });
    (api::create_app(state, get_metrics_handle()), registry, directory)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let (app, _, _) = setup();

    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["open_connections"], 0);
}

#[tokio::test]
async fn test_registry_stats_lists_cached_databases() {
    let (app, registry, directory) = setup();
    let a = directory.register("store_a").await;
    let b = directory.register("store_b").await;
    registry.acquire(a).await.unwrap();
    registry.acquire(b).await.unwrap();
    registry.acquire(b).await.unwrap();

    let (status, json) = get_json(app, "/registry/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_connections"], 2);
    assert_eq!(json["pending_inits"], 0);
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["database_id"], "store_a");
    assert_eq!(entries[1]["access_count"], 2);
}

#[tokio::test]
async fn test_health_reflects_shutdown() {
    let (app, registry, directory) = setup();
    let tenant = directory.register("store_a").await;
    registry.acquire(tenant).await.unwrap();
    registry.shutdown().await;

    let (_, json) = get_json(app, "/health").await;
    assert_eq!(json["open_connections"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, registry, directory) = setup();
    let tenant = directory.register("store_a").await;
    registry.acquire(tenant).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _, _) = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/orders")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
