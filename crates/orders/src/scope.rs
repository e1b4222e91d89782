//! Transactional scope abstraction over a tenant's storage.

use async_trait::async_trait;
use common::{OrderId, ProductId};

use crate::error::Result;
use crate::model::{AuditEvent, OrderAggregate, PaymentRecord};

/// Storage reachable through a tenant handle.
///
/// Implemented by the handle type the tenant registry hands out, so the
/// orchestrator can open scopes on whatever the registry cached.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Opens a new transactional scope.
    async fn begin(&self) -> Result<Box<dyn OrderScope>>;

    /// Reads a committed order with its lines.
    async fn load_order(&self, order_id: OrderId) -> Result<Option<OrderAggregate>>;

    /// Reads committed stock on hand, `None` if the product does not exist.
    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>>;
}

/// A unit of work whose writes commit or roll back together.
///
/// Dropping a scope without committing discards its writes and releases
/// its row locks.
#[async_trait]
pub trait OrderScope: Send {
    /// Reads stock without taking a lock.
    async fn read_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Locks the product row until the scope ends and returns its stock.
    async fn lock_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>>;

    /// Decrements stock on a locked row and returns the remaining quantity.
    async fn decrement_stock(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64>;

    /// Inserts the order header and its lines.
    async fn insert_order(&mut self, order: &OrderAggregate) -> Result<()>;

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<()>;

    async fn insert_audit_event(&mut self, event: &AuditEvent) -> Result<()>;

    /// Commits every write made through this scope.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every write made through this scope.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
