//! Operational server for the tenant connection registry.
//!
//! Wires the registry to the directory and tenant databases, runs the idle
//! sweeper, and exposes health, registry stats and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tenancy::{
    ConnectionFactory, DirectoryLookup, PgConnectionFactory, PgDirectory, PgFactoryConfig,
    RegistryConfig, TenantRegistry,
};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;

/// Shared application state accessible from all handlers.
pub struct AppState<D, F: ConnectionFactory> {
    pub registry: TenantRegistry<D, F>,
}

/// Registry over the PostgreSQL directory and tenant databases.
pub type PgRegistry = TenantRegistry<PgDirectory, PgConnectionFactory>;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<D, F>(state: Arc<AppState<D, F>>, metrics_handle: PrometheusHandle) -> Router
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::<D, F>))
        .route("/registry/stats", get(routes::registry_stats::<D, F>))
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// Connects to the directory database and builds the tenant registry.
///
/// Tenant pools are opened lazily by the registry. When
/// `TENANT_RUN_MIGRATIONS` is set, each new pool syncs the tenant schema.
pub async fn connect_registry(config: &Config) -> Result<PgRegistry, StartupError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.directory_url)
        .await
        .map_err(StartupError::Directory)?;
    let directory = PgDirectory::new(pool);
    if config.run_directory_migrations {
        directory.run_migrations().await?;
        tracing::info!("directory migrations applied");
    }

    let pool_config = PgFactoryConfig::from_env();
    let run_tenant_migrations = pool_config.run_migrations;
    let mut factory = PgConnectionFactory::new(pool_config).map_err(StartupError::TenantUrl)?;
    if run_tenant_migrations {
        factory = factory.with_migrator(&orders::postgres::MIGRATOR);
    }

    let registry_config = RegistryConfig::from_env();
    tracing::info!(
        max_connections = registry_config.max_connections,
        idle_timeout_secs = registry_config.idle_timeout.as_secs(),
        sweep_interval_secs = registry_config.sweep_interval.as_secs(),
        "tenant registry configured"
    );
    Ok(TenantRegistry::new(directory, factory, registry_config))
}
