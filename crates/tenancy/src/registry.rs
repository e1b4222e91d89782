//! Registry of open tenant handles.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::sweeper;
use crate::{
    ConnectionFactory, DatabaseId, DirectoryLookup, RegistryConfig, RegistryError, Result,
    TenantHandle, TenantId,
};

/// An initialization in flight, shared by every caller asking for the same database.
type PendingInit<H> = Shared<BoxFuture<'static, Result<H>>>;

struct CacheEntry<H> {
    handle: H,
    opened_at: DateTime<Utc>,
    last_accessed: Instant,
    access_count: u64,
}

impl<H> CacheEntry<H> {
    fn new(handle: H) -> Self {
        Self {
            handle,
            opened_at: Utc::now(),
            last_accessed: Instant::now(),
            access_count: 1,
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }

    fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed)
    }
}

/// Cache and pending-init maps. Always read and written under one lock,
/// so "is it cached / is it pending / start it" is a single step.
struct RegistryState<H> {
    entries: HashMap<DatabaseId, CacheEntry<H>>,
    pending: HashMap<DatabaseId, PendingInit<H>>,
    shut_down: bool,
}

impl<H: TenantHandle> RegistryState<H> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
            shut_down: false,
        }
    }

    /// Removes up to `count` entries, least recently accessed first.
    fn evict_oldest(&mut self, count: usize) -> Vec<(DatabaseId, H)> {
        let mut by_age: Vec<(DatabaseId, Instant)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, last_accessed)| *last_accessed);

        by_age
            .into_iter()
            .take(count)
            .filter_map(|(id, _)| self.entries.remove(&id).map(|entry| (id, entry.handle)))
            .collect()
    }

    /// Removes every entry idle for longer than `idle_timeout`.
    fn remove_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<(DatabaseId, H)> {
        let expired: Vec<DatabaseId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.idle(now) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry.handle)))
            .collect()
    }

    fn record_gauge(&self) {
        metrics::gauge!("tenant_registry_open_connections").set(self.entries.len() as f64);
    }
}

/// Snapshot of the registry, for introspection only.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub pending_inits: usize,
    pub entries: Vec<EntryStats>,
}

/// Bookkeeping for a single cached handle.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStats {
    pub database_id: DatabaseId,
    pub opened_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub access_count: u64,
}

pub(crate) struct RegistryInner<D, F: ConnectionFactory> {
    directory: D,
    factory: F,
    config: RegistryConfig,
    state: Mutex<RegistryState<F::Handle>>,
    sweeper: OnceLock<AbortHandle>,
}

/// Concurrency-safe cache of per-tenant database handles.
///
/// At most one handle is kept per database id. Concurrent requests for a
/// database that is still being opened wait on the same initialization
/// instead of opening a second connection. Handles are reclaimed when the
/// cache is full (least recently used first) and by a background sweep
/// once they have been idle for longer than the configured timeout.
///
/// The registry is cheap to clone; clones share the same cache.
pub struct TenantRegistry<D, F: ConnectionFactory> {
    inner: Arc<RegistryInner<D, F>>,
}

impl<D, F: ConnectionFactory> Clone for TenantRegistry<D, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, F> TenantRegistry<D, F>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    /// Creates an empty registry. The idle sweeper is not started.
    pub fn new(directory: D, factory: F, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                directory,
                factory,
                config,
                state: Mutex::new(RegistryState::new()),
                sweeper: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Returns a live handle for the tenant's database.
    ///
    /// Fails with `NotFound` if the tenant is missing, inactive,
    /// soft-deleted or has no database; nothing is cached in that case.
    #[tracing::instrument(skip(self), fields(%tenant_id))]
    pub async fn acquire(&self, tenant_id: TenantId) -> Result<F::Handle> {
        let database_id = self.resolve(tenant_id).await?;
        self.acquire_database(&database_id).await
    }

    /// Returns a live handle for an already resolved database id.
    pub async fn acquire_database(&self, database_id: &DatabaseId) -> Result<F::Handle> {
        let mut discarded = Vec::new();

        let pending = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(RegistryError::ShutDown);
            }

            let cached = state.entries.get_mut(database_id).map(|entry| {
                if entry.handle.is_closed() {
                    None
                } else {
                    entry.touch();
                    Some(entry.handle.clone())
                }
            });

            match cached {
                Some(Some(handle)) => {
                    metrics::counter!("tenant_registry_cache_hits_total").increment(1);
                    return Ok(handle);
                }
                Some(None) => {
                    tracing::debug!(%database_id, "cached tenant connection was closed, reopening");
                    if let Some(stale) = state.entries.remove(database_id) {
                        discarded.push((database_id.clone(), stale.handle, "stale"));
                    }
                }
                None => {}
            }

            match state.pending.get(database_id) {
                Some(pending) => {
                    metrics::counter!("tenant_registry_coalesced_total").increment(1);
                    pending.clone()
                }
                None => {
                    metrics::counter!("tenant_registry_cache_misses_total").increment(1);

                    let max = self.inner.config.max_connections;
                    let in_use = state.entries.len() + state.pending.len();
                    if in_use >= max {
                        let count = self.inner.config.eviction_batch().max(in_use + 1 - max);
                        let evicted = state.evict_oldest(count);
                        tracing::info!(
                            evicted = evicted.len(),
                            max_connections = max,
                            "tenant registry at capacity, evicting least recently used"
                        );
                        discarded.extend(evicted.into_iter().map(|(id, h)| (id, h, "capacity")));
                    }

                    let pending = self.begin_init(database_id.clone());
                    state.pending.insert(database_id.clone(), pending.clone());
                    state.record_gauge();
                    pending
                }
            }
        };

        close_in_background(discarded);

        pending.await
    }

    /// Closes and evicts one entry. Returns false if nothing was cached.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, database_id: &DatabaseId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let removed = state.entries.remove(database_id);
            state.record_gauge();
            removed
        };

        match removed {
            Some(entry) => {
                close_handle(database_id, &entry.handle, "released").await;
                true
            }
            None => false,
        }
    }

    /// Returns a snapshot of the cache. Does not touch any entry.
    pub async fn stats(&self) -> RegistryStats {
        let state = self.inner.state.lock().await;
        let now = Instant::now();

        let mut entries: Vec<EntryStats> = state
            .entries
            .iter()
            .map(|(id, entry)| EntryStats {
                database_id: id.clone(),
                opened_at: entry.opened_at,
                idle_secs: entry.idle(now).as_secs(),
                access_count: entry.access_count,
            })
            .collect();
        entries.sort_by(|a, b| a.database_id.cmp(&b.database_id));

        RegistryStats {
            total_connections: state.entries.len(),
            pending_inits: state.pending.len(),
            entries,
        }
    }

    /// Runs one idle sweep now and returns how many entries were closed.
    pub async fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle().await
    }

    /// Spawns the background idle sweep on the current tokio runtime.
    ///
    /// Returns false if a sweeper was already started for this registry.
    /// The task stops on `shutdown` or once every registry clone is dropped.
    pub fn start_idle_sweeper(&self) -> bool {
        if self.inner.sweeper.get().is_some() {
            return false;
        }

        let task = sweeper::spawn(Arc::downgrade(&self.inner), self.inner.config.sweep_interval);
        if self.inner.sweeper.set(task.abort_handle()).is_err() {
            task.abort();
            return false;
        }
        true
    }

    /// Closes every open handle and clears all maps.
    ///
    /// Subsequent `acquire` calls fail with `ShutDown`. An initialization
    /// still in flight closes its handle when it completes.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.inner.sweeper.get() {
            sweeper.abort();
        }

        let drained: Vec<(DatabaseId, F::Handle)> = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.pending.clear();
            let drained = state
                .entries
                .drain()
                .map(|(id, entry)| (id, entry.handle))
                .collect();
            state.record_gauge();
            drained
        };

        tracing::info!(connections = drained.len(), "shutting down tenant registry");
        close_all(&drained, "shutdown").await;
    }

    async fn resolve(&self, tenant_id: TenantId) -> Result<DatabaseId> {
        let record = self
            .inner
            .directory
            .resolve(tenant_id)
            .await
            .map_err(|e| match e {
                RegistryError::NotFound { .. } => e,
                other => RegistryError::not_found(tenant_id, other.to_string()),
            })?;

        if let Some(reason) = record.unusable_reason() {
            tracing::debug!(%tenant_id, reason, "tenant rejected");
            return Err(RegistryError::not_found(tenant_id, reason));
        }

        Ok(record.database_id)
    }

    /// Starts opening a handle on a separate task.
    ///
    /// The task itself clears the pending entry and stores the result, so
    /// the outcome is recorded even if every caller stops waiting.
    fn begin_init(&self, database_id: DatabaseId) -> PendingInit<F::Handle> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            let database_id = database_id.clone();
            async move { inner.initialize(database_id).await }
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    inner.state.lock().await.pending.remove(&database_id);
                    Err(RegistryError::connection(
                        &database_id,
                        format!("initialization task failed: {join_error}"),
                    ))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl<D, F> RegistryInner<D, F>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
{
    async fn initialize(&self, database_id: DatabaseId) -> Result<F::Handle> {
        let timeout = self.config.connect_timeout;
        let opened = match tokio::time::timeout(timeout, self.factory.open(&database_id)).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::ConnectionTimeout {
                database_id: database_id.clone(),
                timeout,
            }),
        };

        let mut state = self.state.lock().await;
        state.pending.remove(&database_id);

        match opened {
            Ok(handle) if state.shut_down => {
                drop(state);
                close_handle(&database_id, &handle, "shutdown").await;
                Err(RegistryError::ShutDown)
            }
            Ok(handle) => {
                // Opens started while the cache was full of pending inits
                // only find room here.
                let max = self.config.max_connections;
                let mut discarded = Vec::new();
                if state.entries.len() >= max {
                    let count = self
                        .config
                        .eviction_batch()
                        .max(state.entries.len() + 1 - max);
                    discarded.extend(
                        state
                            .evict_oldest(count)
                            .into_iter()
                            .map(|(id, h)| (id, h, "capacity")),
                    );
                    tracing::info!(
                        evicted = discarded.len(),
                        max_connections = max,
                        "tenant registry full on insert, evicting least recently used"
                    );
                }

                state
                    .entries
                    .insert(database_id.clone(), CacheEntry::new(handle.clone()));
                state.record_gauge();
                close_in_background(discarded);
                metrics::counter!("tenant_registry_connections_opened_total").increment(1);
                tracing::info!(
                    %database_id,
                    total = state.entries.len(),
                    "tenant connection opened"
                );
                Ok(handle)
            }
            Err(e) => {
                metrics::counter!("tenant_registry_connection_failures_total").increment(1);
                tracing::warn!(%database_id, error = %e, "tenant connection failed");
                Err(e)
            }
        }
    }

    pub(crate) async fn sweep_idle(&self) -> usize {
        let expired = {
            let mut state = self.state.lock().await;
            let expired = state.remove_idle(Instant::now(), self.config.idle_timeout);
            state.record_gauge();
            expired
        };

        if !expired.is_empty() {
            tracing::info!(
                evicted = expired.len(),
                idle_timeout_secs = self.config.idle_timeout.as_secs(),
                "idle sweep reclaimed tenant connections"
            );
        }
        close_all(&expired, "idle").await;
        expired.len()
    }
}

/// Best-effort close. A failure is logged; the entry is already gone.
async fn close_handle<H: TenantHandle>(database_id: &DatabaseId, handle: &H, reason: &'static str) {
    metrics::counter!("tenant_registry_evictions_total", "reason" => reason).increment(1);
    match handle.close().await {
        Ok(()) => tracing::debug!(%database_id, reason, "tenant connection closed"),
        Err(e) => tracing::warn!(
            %database_id,
            reason,
            error = %e,
            "failed to close tenant connection, dropping it anyway"
        ),
    }
}

/// Closes discarded handles on a detached task; callers never wait on them.
fn close_in_background<H: TenantHandle>(discarded: Vec<(DatabaseId, H, &'static str)>) {
    if discarded.is_empty() {
        return;
    }
    tokio::spawn(async move {
        join_all(
            discarded
                .iter()
                .map(|(id, handle, reason)| close_handle(id, handle, *reason)),
        )
        .await;
    });
}

async fn close_all<H: TenantHandle>(handles: &[(DatabaseId, H)], reason: &'static str) {
    join_all(
        handles
            .iter()
            .map(|(id, handle)| close_handle(id, handle, reason)),
    )
    .await;
}
