//! Stock checks and decrements inside a transactional scope.

use std::collections::BTreeMap;

use common::ProductId;

use crate::error::{OrderError, Result};
use crate::model::OrderLineRequest;
use crate::scope::OrderScope;

/// Stock removed for one product by an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: ProductId,
    pub quantity: i64,
    pub remaining: i64,
}

/// Read and decrement primitives for product stock.
///
/// Lines naming the same product are summed, and products are always
/// visited in ascending id order so concurrent scopes lock rows in the
/// same sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryGuard;

impl InventoryGuard {
    pub fn new() -> Self {
        Self
    }

    /// Total requested quantity per product, ordered by product id.
    pub fn demand(lines: &[OrderLineRequest]) -> BTreeMap<ProductId, i64> {
        let mut demand = BTreeMap::new();
        for line in lines {
            *demand.entry(line.product_id.clone()).or_insert(0) += i64::from(line.quantity);
        }
        demand
    }

    /// Unlocked pre-check: every product exists with enough stock.
    ///
    /// Runs before any mutation so obviously bad orders fail early. The
    /// authoritative check happens again under lock in [`decrement`].
    ///
    /// [`decrement`]: InventoryGuard::decrement
    pub async fn validate(
        &self,
        scope: &mut dyn OrderScope,
        lines: &[OrderLineRequest],
    ) -> Result<()> {
        for (product_id, requested) in Self::demand(lines) {
            let available = scope
                .read_stock(&product_id)
                .await?
                .ok_or_else(|| OrderError::NotFound(format!("product {product_id}")))?;
            if available < requested {
                return Err(OrderError::InsufficientStock {
                    product_id,
                    requested,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Locks each product row, re-checks stock and decrements it.
    pub async fn decrement(
        &self,
        scope: &mut dyn OrderScope,
        lines: &[OrderLineRequest],
    ) -> Result<Vec<StockChange>> {
        let demand = Self::demand(lines);
        let mut changes = Vec::with_capacity(demand.len());

        for (product_id, requested) in demand {
            let available = scope
                .lock_stock(&product_id)
                .await?
                .ok_or_else(|| OrderError::NotFound(format!("product {product_id}")))?;
            if available < requested {
                return Err(OrderError::InsufficientStock {
                    product_id,
                    requested,
                    available,
                });
            }

            let remaining = scope.decrement_stock(&product_id, requested).await?;
            tracing::debug!(%product_id, requested, remaining, "stock decremented");
            changes.push(StockChange {
                product_id,
                quantity: requested,
                remaining,
            });
        }
        Ok(changes)
    }
}
