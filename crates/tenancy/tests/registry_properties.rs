//! Behavioural properties of the tenant registry, run against the
//! in-memory directory and connection factory.

use std::time::Duration;

use futures_util::future::join_all;
use tenancy::{
    DatabaseId, InMemoryConnectionFactory, InMemoryDirectory, InMemoryHandle, RegistryConfig,
    RegistryError, TenantHandle, TenantId, TenantRegistry,
};

type Registry = TenantRegistry<InMemoryDirectory, InMemoryConnectionFactory>;

fn registry_with(
    config: RegistryConfig,
    factory: InMemoryConnectionFactory,
) -> (Registry, InMemoryDirectory) {
    let directory = InMemoryDirectory::new();
    let registry = TenantRegistry::new(directory.clone(), factory, config);
    (registry, directory)
}

async fn register_many(directory: &InMemoryDirectory, count: usize) -> Vec<TenantId> {
    let mut tenants = Vec::with_capacity(count);
    for i in 0..count {
        tenants.push(directory.register(format!("store_{i}")).await);
    }
    tenants
}

/// Lets detached close tasks run before asserting on evicted handles.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// In-flight coalescing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_open_one_connection() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_millis(200));
    let (registry, directory) = registry_with(RegistryConfig::default(), factory.clone());
    let tenant = directory.register("store_1").await;

    let results = join_all((0..25).map(|_| registry.acquire(tenant))).await;

    assert_eq!(factory.open_count(), 1);
    let handles: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert!(handles.iter().all(|h| h.connection_id() == 1));

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.pending_inits, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_across_threads_open_one_connection() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_millis(50));
    let (registry, directory) = registry_with(RegistryConfig::default(), factory.clone());
    let tenant = directory.register("store_1").await;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(tenant).await })
        })
        .collect();

    let mut connection_ids = Vec::new();
    for task in tasks {
        connection_ids.push(task.await.unwrap().unwrap().connection_id());
    }

    assert_eq!(factory.open_count(), 1);
    assert!(connection_ids.iter().all(|id| *id == connection_ids[0]));
}

#[tokio::test(start_paused = true)]
async fn tenants_sharing_a_database_share_the_handle() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_millis(100));
    let (registry, directory) = registry_with(RegistryConfig::default(), factory.clone());
    let a = directory.register("shared_db").await;
    let b = directory.register("shared_db").await;

    let (ha, hb) = tokio::join!(registry.acquire(a), registry.acquire(b));

    assert_eq!(ha.unwrap().connection_id(), hb.unwrap().connection_id());
    assert_eq!(factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_initialization_reaches_every_waiter() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_millis(100));
    factory.set_fail_on_open(true);
    let (registry, directory) = registry_with(RegistryConfig::default(), factory.clone());
    let tenant = directory.register("store_1").await;

    let results = join_all((0..10).map(|_| registry.acquire(tenant))).await;

    assert_eq!(factory.open_count(), 1);
    assert!(
        results
            .iter()
            .all(|r| matches!(r, Err(RegistryError::Connection { .. })))
    );

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.pending_inits, 0);
}

#[tokio::test(start_paused = true)]
async fn initialization_survives_cancelled_caller() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_secs(1));
    let (registry, directory) = registry_with(RegistryConfig::default(), factory.clone());
    let tenant = directory.register("store_1").await;

    let abandoned = tokio::time::timeout(Duration::from_millis(10), registry.acquire(tenant)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = registry.stats().await;
    assert_eq!(stats.pending_inits, 0);
    assert_eq!(stats.total_connections, 1);

    registry.acquire(tenant).await.unwrap();
    assert_eq!(factory.open_count(), 1);
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn capacity_evicts_least_recently_used() {
    let config = RegistryConfig::default().with_max_connections(5);
    let (registry, directory) = registry_with(config, InMemoryConnectionFactory::new());
    let tenants = register_many(&directory, 6).await;

    let mut handles = Vec::new();
    for tenant in &tenants[..5] {
        handles.push(registry.acquire(*tenant).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    // Touch store_0 so store_1 becomes the least recently used.
    registry.acquire(tenants[0]).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    registry.acquire(tenants[5]).await.unwrap();
    settle().await;

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 5);
    assert!(
        !stats
            .entries
            .iter()
            .any(|e| e.database_id == DatabaseId::new("store_1"))
    );
    assert!(handles[1].is_closed());
    assert!(!handles[0].is_closed());
}

#[tokio::test(start_paused = true)]
async fn capacity_eviction_removes_a_fifth() {
    let config = RegistryConfig::default().with_max_connections(10);
    let (registry, directory) = registry_with(config, InMemoryConnectionFactory::new());
    let tenants = register_many(&directory, 11).await;

    let mut handles = Vec::new();
    for tenant in &tenants[..10] {
        handles.push(registry.acquire(*tenant).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(registry.stats().await.total_connections, 10);

    registry.acquire(tenants[10]).await.unwrap();
    settle().await;

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 9);
    assert!(handles[0].is_closed());
    assert!(handles[1].is_closed());
    assert!(!handles[2].is_closed());
}

#[tokio::test(start_paused = true)]
async fn capacity_is_never_exceeded() {
    let config = RegistryConfig::default().with_max_connections(4);
    let (registry, directory) = registry_with(config, InMemoryConnectionFactory::new());
    let tenants = register_many(&directory, 20).await;

    for (i, tenant) in tenants.iter().enumerate() {
        registry.acquire(*tenant).await.unwrap();
        // Re-acquire an older tenant every so often to mix up recency.
        if i % 3 == 0 {
            registry.acquire(tenants[i / 2]).await.unwrap();
        }
        tokio::time::advance(Duration::from_millis(10)).await;

        let stats = registry.stats().await;
        assert!(stats.total_connections + stats.pending_inits <= 4);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_opens_of_distinct_databases_respect_capacity() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_secs(1));
    let config = RegistryConfig::default().with_max_connections(2);
    let (registry, directory) = registry_with(config, factory.clone());
    let tenants = register_many(&directory, 5).await;

    let results = join_all(tenants.iter().map(|tenant| registry.acquire(*tenant))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(factory.open_count(), 5);

    let stats = registry.stats().await;
    assert!(stats.total_connections <= 2);
    assert_eq!(stats.pending_inits, 0);
}

#[tokio::test(start_paused = true)]
async fn eviction_does_not_wait_for_slow_close() {
    let factory = InMemoryConnectionFactory::with_opener(|db: &DatabaseId, id| {
        InMemoryHandle::new(db.clone(), id).with_close_delay(Duration::from_secs(3600))
    });
    let config = RegistryConfig::default().with_max_connections(1);
    let (registry, directory) = registry_with(config, factory);
    let tenants = register_many(&directory, 2).await;

    let first = registry.acquire(tenants[0]).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), registry.acquire(tenants[1])).await;

    assert!(matches!(second, Ok(Ok(_))));
    assert!(!first.is_closed());

    tokio::time::sleep(Duration::from_secs(3601)).await;
    assert!(first.is_closed());
    assert_eq!(registry.stats().await.total_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn zero_sweep_interval_does_not_stop_the_sweeper() {
    let config = RegistryConfig::default()
        .with_sweep_interval(Duration::ZERO)
        .with_idle_timeout(Duration::from_secs(5));
    let (registry, directory) = registry_with(config, InMemoryConnectionFactory::new());
    let tenant = directory.register("store_1").await;
    let handle = registry.acquire(tenant).await.unwrap();

    assert!(registry.start_idle_sweeper());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(handle.is_closed());
    assert_eq!(registry.stats().await.total_connections, 0);
}

// ============================================================================
// Idle reclamation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sweep_reclaims_only_expired_entries() {
    let config = RegistryConfig::default().with_idle_timeout(Duration::from_secs(60));
    let (registry, directory) = registry_with(config, InMemoryConnectionFactory::new());
    let old = directory.register("store_old").await;
    let fresh = directory.register("store_fresh").await;

    let old_handle = registry.acquire(old).await.unwrap();
    tokio::time::advance(Duration::from_secs(45)).await;
    let fresh_handle = registry.acquire(fresh).await.unwrap();

    tokio::time::advance(Duration::from_secs(15)).await;
    // store_old is idle for exactly the timeout, which does not exceed it.
    assert_eq!(registry.sweep_idle().await, 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(registry.sweep_idle().await, 1);
    assert!(old_handle.is_closed());
    assert!(!fresh_handle.is_closed());
    assert_eq!(registry.stats().await.total_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_reclaims_idle_entries() {
    let (registry, directory) = registry_with(RegistryConfig::default(), InMemoryConnectionFactory::new());
    let tenant = directory.register("store_1").await;
    assert!(registry.start_idle_sweeper());
    assert!(!registry.start_idle_sweeper());

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    let handle = registry.acquire(tenant).await.unwrap();

    // Sweeps run every 5 minutes. At the 30 minute sweep the entry has
    // been idle for 28 minutes, at the 35 minute sweep for 33.
    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    assert_eq!(registry.stats().await.total_connections, 1);
    assert!(!handle.is_closed());

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;
    assert_eq!(registry.stats().await.total_connections, 0);
    assert!(handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn access_resets_idle_clock() {
    let (registry, directory) = registry_with(RegistryConfig::default(), InMemoryConnectionFactory::new());
    let tenant = directory.register("store_1").await;
    registry.start_idle_sweeper();

    registry.acquire(tenant).await.unwrap();
    tokio::time::sleep(Duration::from_secs(21 * 60)).await;
    registry.acquire(tenant).await.unwrap();
    tokio::time::sleep(Duration::from_secs(21 * 60)).await;

    let stats = registry.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.entries[0].access_count, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_sweeper_and_rejects_acquire() {
    let (registry, directory) = registry_with(RegistryConfig::default(), InMemoryConnectionFactory::new());
    let tenant = directory.register("store_1").await;
    registry.start_idle_sweeper();
    let handle = registry.acquire(tenant).await.unwrap();

    registry.shutdown().await;

    assert!(handle.is_closed());
    assert!(matches!(
        registry.acquire(tenant).await,
        Err(RegistryError::ShutDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_initialization_closes_late_handle() {
    let factory = InMemoryConnectionFactory::new().with_open_delay(Duration::from_secs(1));
    let (registry, directory) = registry_with(RegistryConfig::default(), factory);
    let tenant = directory.register("store_1").await;

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.acquire(tenant).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.shutdown().await;

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(RegistryError::ShutDown)));
    assert_eq!(registry.stats().await.total_connections, 0);
}
