//! Atomic order creation for tenant stores.
//!
//! `OrderOrchestrator::create_order_atomic` validates and decrements stock,
//! persists the order with its lines, captures payment, and appends audit
//! events inside one transactional scope on the tenant's database. Either
//! every effect commits or none does.

pub mod audit;
pub mod error;
pub mod inventory;
pub mod lines;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod payment;
pub mod postgres;
pub mod scope;
pub mod status;
pub mod totals;

pub use audit::{AuditSink, ScopedAuditSink};
pub use common::{ActorId, Money, OrderId, PaymentMethodRef, ProductId, TenantId};
pub use error::{OrderError, Result};
pub use inventory::{InventoryGuard, StockChange};
pub use lines::{LineDiff, diff_lines};
pub use memory::{InMemoryDatabases, InMemoryTenantStore};
pub use model::{
    AuditAction, AuditEvent, OrderAggregate, OrderLine, OrderLineRequest, OrderRequest,
    PaymentRecord, PaymentStatus,
};
pub use orchestrator::{OrchestratorConfig, OrderOrchestrator};
pub use payment::{InMemoryPaymentCollaborator, PaymentCollaborator, PaymentReceipt};
pub use scope::{OrderScope, TenantStore};
pub use status::OrderStatus;
pub use totals::{OrderTotals, compute_totals};
