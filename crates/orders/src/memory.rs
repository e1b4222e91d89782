//! In-memory tenant storage for testing.
//!
//! Each database keeps committed tables behind one lock and a row lock per
//! product. Scopes stage their writes and apply them on commit, holding the
//! row locks they took until they commit, roll back or are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use common::{DatabaseId, OrderId, ProductId};
use tenancy::{InMemoryConnectionFactory, TenantHandle};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{OrderError, Result};
use crate::model::{AuditEvent, OrderAggregate, PaymentRecord};
use crate::scope::{OrderScope, TenantStore};

#[derive(Debug, Default)]
struct Tables {
    stock: HashMap<ProductId, i64>,
    orders: HashMap<OrderId, OrderAggregate>,
    codes: HashSet<String>,
    payments: Vec<PaymentRecord>,
    audit_events: Vec<AuditEvent>,
}

#[derive(Debug, Default)]
struct TenantData {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<ProductId, Arc<Mutex<()>>>>,
    fail_on_commit: AtomicBool,
}

/// A set of in-memory tenant databases keyed by database id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabases {
    databases: Arc<StdMutex<HashMap<DatabaseId, Arc<TenantData>>>>,
}

impl InMemoryDatabases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle on `database_id`, creating an empty database on first use.
    pub fn database(&self, database_id: impl Into<DatabaseId>) -> InMemoryTenantStore {
        self.open(database_id.into(), 0)
    }

    /// A connection factory whose handles share these databases.
    pub fn connection_factory(&self) -> InMemoryConnectionFactory<InMemoryTenantStore> {
        let databases = self.clone();
        InMemoryConnectionFactory::with_opener(move |database_id: &DatabaseId, connection_id| {
            databases.open(database_id.clone(), connection_id)
        })
    }

    fn open(&self, database_id: DatabaseId, connection_id: u64) -> InMemoryTenantStore {
        let data = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(database_id.clone())
            .or_default()
            .clone();

        InMemoryTenantStore {
            database_id,
            connection_id,
            data,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A handle on one in-memory tenant database.
///
/// Clones share the closed flag; separate opens of the same database share
/// the data but close independently.
#[derive(Debug, Clone)]
pub struct InMemoryTenantStore {
    database_id: DatabaseId,
    connection_id: u64,
    data: Arc<TenantData>,
    closed: Arc<AtomicBool>,
}

impl InMemoryTenantStore {
    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Sets committed stock on hand, creating the product if needed.
    pub async fn set_stock(&self, product_id: impl Into<ProductId>, quantity: i64) {
        self.data
            .tables
            .lock()
            .await
            .stock
            .insert(product_id.into(), quantity);
    }

    /// Makes every commit fail, leaving committed data untouched.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.data.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    pub async fn order_count(&self) -> usize {
        self.data.tables.lock().await.orders.len()
    }

    pub async fn payments(&self) -> Vec<PaymentRecord> {
        self.data.tables.lock().await.payments.clone()
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.data.tables.lock().await.audit_events.clone()
    }
}

#[async_trait]
impl TenantHandle for InMemoryTenantStore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> tenancy::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn begin(&self) -> Result<Box<dyn OrderScope>> {
        if self.is_closed() {
            return Err(OrderError::Connection(format!(
                "connection to {} is closed",
                self.database_id
            )));
        }
        Ok(Box::new(InMemoryOrderScope::new(self.data.clone())))
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<OrderAggregate>> {
        Ok(self.data.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>> {
        Ok(self.data.tables.lock().await.stock.get(product_id).copied())
    }
}

struct InMemoryOrderScope {
    data: Arc<TenantData>,
    row_guards: HashMap<ProductId, OwnedMutexGuard<()>>,
    decrements: HashMap<ProductId, i64>,
    orders: Vec<OrderAggregate>,
    payments: Vec<PaymentRecord>,
    audit_events: Vec<AuditEvent>,
}

impl InMemoryOrderScope {
    fn new(data: Arc<TenantData>) -> Self {
        Self {
            data,
            row_guards: HashMap::new(),
            decrements: HashMap::new(),
            orders: Vec::new(),
            payments: Vec::new(),
            audit_events: Vec::new(),
        }
    }

    /// Committed stock minus what this scope has already decremented.
    async fn visible_stock(&self, product_id: &ProductId) -> Option<i64> {
        let committed = self.data.tables.lock().await.stock.get(product_id).copied()?;
        Some(committed - self.decrements.get(product_id).copied().unwrap_or(0))
    }

    fn code_conflict(code: &str) -> OrderError {
        OrderError::Validation(format!("conflict on unique_order_code: {code}"))
    }
}

#[async_trait]
impl OrderScope for InMemoryOrderScope {
    async fn read_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        Ok(self.visible_stock(product_id).await)
    }

    async fn lock_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        if !self.row_guards.contains_key(product_id) {
            let row = self
                .data
                .row_locks
                .lock()
                .await
                .entry(product_id.clone())
                .or_default()
                .clone();
            let guard = row.lock_owned().await;
            self.row_guards.insert(product_id.clone(), guard);
        }
        Ok(self.visible_stock(product_id).await)
    }

    async fn decrement_stock(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64> {
        let available = self
            .lock_stock(product_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(format!("product {product_id}")))?;
        if available < quantity {
            return Err(OrderError::InsufficientStock {
                product_id: product_id.clone(),
                requested: quantity,
                available,
            });
        }
        *self.decrements.entry(product_id.clone()).or_insert(0) += quantity;
        Ok(available - quantity)
    }

    async fn insert_order(&mut self, order: &OrderAggregate) -> Result<()> {
        let taken = self.data.tables.lock().await.codes.contains(&order.code)
            || self.orders.iter().any(|o| o.code == order.code);
        if taken {
            return Err(Self::code_conflict(&order.code));
        }
        self.orders.push(order.clone());
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<()> {
        self.payments.push(payment.clone());
        Ok(())
    }

    async fn insert_audit_event(&mut self, event: &AuditEvent) -> Result<()> {
        self.audit_events.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let scope = *self;
        if scope.data.fail_on_commit.load(Ordering::SeqCst) {
            return Err(OrderError::Transaction(
                "commit failed: storage unavailable".to_string(),
            ));
        }

        let mut tables = scope.data.tables.lock().await;
        if let Some(order) = scope.orders.iter().find(|o| tables.codes.contains(&o.code)) {
            return Err(Self::code_conflict(&order.code));
        }

        for (product_id, quantity) in scope.decrements {
            if let Some(stock) = tables.stock.get_mut(&product_id) {
                *stock -= quantity;
            }
        }
        for order in scope.orders {
            tables.codes.insert(order.code.clone());
            tables.orders.insert(order.id, order);
        }
        tables.payments.extend(scope.payments);
        tables.audit_events.extend(scope.audit_events);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{ActorId, Money};

    use crate::status::OrderStatus;

    fn order(code: &str) -> OrderAggregate {
        OrderAggregate {
            id: OrderId::new(),
            code: code.to_string(),
            customer_id: "cust-1".to_string(),
            status: OrderStatus::Pending,
            total_amount: Money::from_cents(100),
            discount: Money::zero(),
            shipping_fee: Money::zero(),
            total_paid: Money::from_cents(100),
            delivery_address: None,
            created_by: ActorId::new("actor-1"),
            created_at: Utc::now(),
            deleted_at: None,
            lines: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = InMemoryDatabases::new().database("store_1");
        store.set_stock("P1", 10).await;
        let p1 = ProductId::new("P1");

        let mut scope = store.begin().await.unwrap();
        assert_eq!(scope.decrement_stock(&p1, 3).await.unwrap(), 7);
        assert_eq!(scope.read_stock(&p1).await.unwrap(), Some(7));
        assert_eq!(store.stock_level(&p1).await.unwrap(), Some(10));

        let order = order("ORD-1");
        scope.insert_order(&order).await.unwrap();
        scope.commit().await.unwrap();

        assert_eq!(store.stock_level(&p1).await.unwrap(), Some(7));
        assert_eq!(store.load_order(order.id).await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = InMemoryDatabases::new().database("store_1");
        store.set_stock("P1", 10).await;
        let p1 = ProductId::new("P1");

        let mut scope = store.begin().await.unwrap();
        scope.decrement_stock(&p1, 3).await.unwrap();
        scope.insert_order(&order("ORD-1")).await.unwrap();
        scope.rollback().await.unwrap();

        assert_eq!(store.stock_level(&p1).await.unwrap(), Some(10));
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_lock_held_until_scope_ends() {
        let store = InMemoryDatabases::new().database("store_1");
        store.set_stock("P1", 1).await;
        let p1 = ProductId::new("P1");

        let mut first = store.begin().await.unwrap();
        first.lock_stock(&p1).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            second.lock_stock(&p1),
        )
        .await;
        assert!(blocked.is_err());

        first.decrement_stock(&p1, 1).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(second.lock_stock(&p1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_dropped_scope_releases_locks() {
        let store = InMemoryDatabases::new().database("store_1");
        store.set_stock("P1", 5).await;
        let p1 = ProductId::new("P1");

        let mut scope = store.begin().await.unwrap();
        scope.decrement_stock(&p1, 5).await.unwrap();
        drop(scope);

        let mut next = store.begin().await.unwrap();
        assert_eq!(next.lock_stock(&p1).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_duplicate_code_is_validation_error() {
        let store = InMemoryDatabases::new().database("store_1");
        let mut scope = store.begin().await.unwrap();
        scope.insert_order(&order("ORD-1")).await.unwrap();
        scope.commit().await.unwrap();

        let mut scope = store.begin().await.unwrap();
        let result = scope.insert_order(&order("ORD-1")).await;
        assert!(matches!(result, Err(OrderError::Validation(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_data_untouched() {
        let store = InMemoryDatabases::new().database("store_1");
        store.set_stock("P1", 5).await;
        store.set_fail_on_commit(true);
        let p1 = ProductId::new("P1");

        let mut scope = store.begin().await.unwrap();
        scope.decrement_stock(&p1, 2).await.unwrap();
        let result = scope.commit().await;

        assert!(matches!(result, Err(OrderError::Transaction(_))));
        assert_eq!(store.stock_level(&p1).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_closed_handle_refuses_scopes() {
        let databases = InMemoryDatabases::new();
        let store = databases.database("store_1");
        store.close().await.unwrap();

        assert!(matches!(store.begin().await, Err(OrderError::Connection(_))));
        // A fresh open of the same database is unaffected.
        assert!(databases.database("store_1").begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_factory_handles_share_data() {
        use tenancy::ConnectionFactory;

        let databases = InMemoryDatabases::new();
        databases.database("store_1").set_stock("P1", 42).await;

        let factory = databases.connection_factory();
        let handle = factory.open(&DatabaseId::new("store_1")).await.unwrap();

        assert_eq!(handle.connection_id(), 1);
        assert_eq!(
            handle.stock_level(&ProductId::new("P1")).await.unwrap(),
            Some(42)
        );
    }
}
