//! Order requests, persisted order rows, payments and audit events.

use chrono::{DateTime, Utc};
use common::{ActorId, Money, OrderId, PaymentMethodRef, ProductId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::status::OrderStatus;

/// One requested line of a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLineRequest {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price,
        }
    }
}

/// Input to atomic order creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Caller-chosen order code; generated when absent.
    pub code: Option<String>,
    pub customer_id: String,
    pub lines: Vec<OrderLineRequest>,
    pub discount: Money,
    pub shipping_fee: Money,
    pub delivery_address: Option<String>,
}

impl OrderRequest {
    pub fn for_customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ..Self::default()
        }
    }

    pub fn with_line(
        mut self,
        product_id: impl Into<ProductId>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        self.lines
            .push(OrderLineRequest::new(product_id, quantity, unit_price));
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_shipping_fee(mut self, shipping_fee: Money) -> Self {
        self.shipping_fee = shipping_fee;
        self
    }

    pub fn with_delivery_address(mut self, address: impl Into<String>) -> Self {
        self.delivery_address = Some(address.into());
        self
    }

    /// Checks the request shape without touching storage.
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(OrderError::validation("order has no lines"));
        }
        for (index, line) in self.lines.iter().enumerate() {
            if line.product_id.is_blank() {
                return Err(OrderError::validation(format!(
                    "line {index} has no product reference"
                )));
            }
            if line.quantity == 0 {
                return Err(OrderError::validation(format!(
                    "line {index} quantity must be greater than zero"
                )));
            }
            if !line.unit_price.is_positive() {
                return Err(OrderError::validation(format!(
                    "line {index} unit price must be greater than zero"
                )));
            }
        }
        if self.code.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(OrderError::validation("order code is blank"));
        }
        Ok(())
    }
}

/// A persisted order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub position: u32,
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_total: Money,
}

/// An order header together with its owned lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub id: OrderId,
    pub code: String,
    pub customer_id: String,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub discount: Money,
    pub shipping_fee: Money,
    pub total_paid: Money,
    pub delivery_address: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub lines: Vec<OrderLine>,
}

impl OrderAggregate {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Total units across all lines.
    pub fn unit_count(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }
}

/// Generates an order code of the form `ORD-<YYYYMMDD>-<8 hex>`.
pub fn generate_order_code(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ORD-{}-{}", now.format("%Y%m%d"), &suffix[..8].to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Captured,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Captured => "CAPTURED",
        }
    }
}

/// A payment captured for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: OrderId,
    pub amount: Money,
    pub payment_method: PaymentMethodRef,
    /// Reference returned by the payment provider.
    pub provider_reference: String,
    pub actor_id: ActorId,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    OrderCreated,
    StockDecremented,
    PaymentCaptured,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::OrderCreated => "order_created",
            AuditAction::StockDecremented => "stock_decremented",
            AuditAction::PaymentCaptured => "payment_captured",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only audit row written in the same scope as the change it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub target_table: String,
    pub target_id: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor_id: ActorId,
        action: AuditAction,
        target_table: &str,
        target_id: impl ToString,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            action,
            target_table: target_table.to_string(),
            target_id: target_id.to_string(),
            metadata,
            created_at: Utc::now(),
        }
    }
}
