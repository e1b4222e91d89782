//! Replace-by-diff for an order's owned line collection.

use std::collections::BTreeMap;

use common::ProductId;

use crate::model::{OrderLine, OrderLineRequest};

/// An existing line whose quantity or unit price differs from the desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChange {
    pub existing: OrderLine,
    pub desired: OrderLineRequest,
}

/// Lines to insert, update and delete to turn one collection into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineDiff {
    pub added: Vec<OrderLineRequest>,
    pub changed: Vec<LineChange>,
    pub removed: Vec<OrderLine>,
}

impl LineDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Computes the explicit line changes between `existing` and `desired`,
/// keyed by product. Desired lines naming the same product are merged,
/// keeping the first unit price. Results are ordered by product.
pub fn diff_lines(existing: &[OrderLine], desired: &[OrderLineRequest]) -> LineDiff {
    let mut wanted: BTreeMap<&ProductId, OrderLineRequest> = BTreeMap::new();
    for line in desired {
        wanted
            .entry(&line.product_id)
            .and_modify(|merged| merged.quantity = merged.quantity.saturating_add(line.quantity))
            .or_insert_with(|| line.clone());
    }

    let current: BTreeMap<&ProductId, &OrderLine> =
        existing.iter().map(|l| (&l.product_id, l)).collect();

    let mut diff = LineDiff::default();
    for (product_id, line) in &current {
        match wanted.remove(product_id) {
            None => diff.removed.push((*line).clone()),
            Some(next) if next.quantity != line.quantity || next.unit_price != line.unit_price => {
                diff.changed.push(LineChange {
                    existing: (*line).clone(),
                    desired: next,
                })
            }
            Some(_) => {}
        }
    }
    diff.added.extend(wanted.into_values());
    diff
}
