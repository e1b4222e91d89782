//! Shared types for the multi-tenant order core.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{ActorId, DatabaseId, OrderId, PaymentMethodRef, ProductId, TenantId};
