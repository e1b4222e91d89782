//! In-memory directory and connection factory for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    ConnectionFactory, DatabaseId, DirectoryLookup, RegistryError, Result, TenantHandle,
    TenantId, TenantRecord,
};

/// In-memory tenant directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    records: Arc<RwLock<HashMap<TenantId, TenantRecord>>>,
    lookups: Arc<AtomicU64>,
    fail_on_resolve: Arc<AtomicBool>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a directory record.
    pub async fn insert(&self, record: TenantRecord) {
        self.records.write().await.insert(record.tenant_id, record);
    }

    /// Registers a new active tenant for the given database and returns its id.
    pub async fn register(&self, database_id: impl Into<DatabaseId>) -> TenantId {
        let tenant_id = TenantId::new();
        self.insert(TenantRecord::active(tenant_id, database_id))
            .await;
        tenant_id
    }

    /// Makes every lookup fail as if the directory were unreachable.
    pub fn set_fail_on_resolve(&self, fail: bool) {
        self.fail_on_resolve.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of lookups served so far.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryLookup for InMemoryDirectory {
    async fn resolve(&self, tenant_id: TenantId) -> Result<TenantRecord> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if self.fail_on_resolve.load(Ordering::SeqCst) {
            return Err(RegistryError::not_found(tenant_id, "directory unavailable"));
        }

        self.records
            .read()
            .await
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(tenant_id, "no directory record"))
    }
}

/// A fake connection that only tracks whether it has been closed.
#[derive(Debug, Clone)]
pub struct InMemoryHandle {
    database_id: DatabaseId,
    connection_id: u64,
    closed: Arc<AtomicBool>,
    fail_on_close: bool,
    close_delay: Duration,
}

impl InMemoryHandle {
    pub fn new(database_id: DatabaseId, connection_id: u64) -> Self {
        Self {
            database_id,
            connection_id,
            closed: Arc::new(AtomicBool::new(false)),
            fail_on_close: false,
            close_delay: Duration::ZERO,
        }
    }

    /// Makes `close` fail and leave the handle open.
    pub fn with_failing_close(mut self) -> Self {
        self.fail_on_close = true;
        self
    }

    /// Makes `close` take `delay`, like a pool draining checked-out connections.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    /// Sequence number assigned by the factory; distinct per open.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

#[async_trait]
impl TenantHandle for InMemoryHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        if self.fail_on_close {
            return Err(RegistryError::connection(&self.database_id, "close failed"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type Opener<H> = Arc<dyn Fn(&DatabaseId, u64) -> H + Send + Sync>;

/// In-memory connection factory for testing.
///
/// Counts every open attempt and can be configured to fail or to take
/// a while, which is how coalescing and timeouts are exercised.
#[derive(Clone)]
pub struct InMemoryConnectionFactory<H = InMemoryHandle> {
    opener: Opener<H>,
    opens: Arc<AtomicU64>,
    fail_on_open: Arc<AtomicBool>,
    open_delay: Duration,
}

impl InMemoryConnectionFactory<InMemoryHandle> {
    /// Creates a factory producing plain `InMemoryHandle`s.
    pub fn new() -> Self {
        Self::with_opener(|database_id: &DatabaseId, connection_id| {
            InMemoryHandle::new(database_id.clone(), connection_id)
        })
    }
}

impl Default for InMemoryConnectionFactory<InMemoryHandle> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TenantHandle> InMemoryConnectionFactory<H> {
    /// Creates a factory that builds handles with `opener`.
    ///
    /// The opener receives the database id and a per-factory sequence number.
    pub fn with_opener(opener: impl Fn(&DatabaseId, u64) -> H + Send + Sync + 'static) -> Self {
        Self {
            opener: Arc::new(opener),
            opens: Arc::new(AtomicU64::new(0)),
            fail_on_open: Arc::new(AtomicBool::new(false)),
            open_delay: Duration::ZERO,
        }
    }

    /// Makes every open take `delay` before completing.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn set_fail_on_open(&self, fail: bool) {
        self.fail_on_open.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of open attempts, successful or not.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<H: TenantHandle> ConnectionFactory for InMemoryConnectionFactory<H> {
    type Handle = H;

    async fn open(&self, database_id: &DatabaseId) -> Result<H> {
        let connection_id = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        if self.fail_on_open.load(Ordering::SeqCst) {
            return Err(RegistryError::connection(database_id, "connection refused"));
        }

        Ok((self.opener)(database_id, connection_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_register_and_resolve() {
        let directory = InMemoryDirectory::new();
        let tenant = directory.register("store_9").await;

        let record = directory.resolve(tenant).await.unwrap();
        assert_eq!(record.database_id, DatabaseId::new("store_9"));
        assert!(record.is_active);
        assert_eq!(directory.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_factory_sequences_connections() {
        let factory = InMemoryConnectionFactory::new();
        let db = DatabaseId::new("store_1");

        let a = factory.open(&db).await.unwrap();
        let b = factory.open(&db).await.unwrap();

        assert_eq!(a.connection_id(), 1);
        assert_eq!(b.connection_id(), 2);
        assert_eq!(factory.open_count(), 2);
    }

    #[tokio::test]
    async fn test_handle_close_shared_by_clones() {
        let handle = InMemoryHandle::new(DatabaseId::new("store_1"), 1);
        let clone = handle.clone();

        handle.close().await.unwrap();
        assert!(clone.is_closed());
    }
}
