//! Order amount arithmetic on integer cents.

use common::Money;

use crate::error::{OrderError, Result};
use crate::model::OrderLineRequest;

/// Amounts derived from an order request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTotals {
    /// `quantity × unit_price` for each line, in request order.
    pub line_totals: Vec<Money>,
    pub total_amount: Money,
    pub discount: Money,
    pub shipping_fee: Money,
    /// `total_amount − discount + shipping_fee`.
    pub total_paid: Money,
}

/// Computes line totals, the order total and the amount to capture.
///
/// Fails with `Validation` on negative discount or shipping, a discount
/// larger than the order total plus shipping, or arithmetic overflow.
pub fn compute_totals(
    lines: &[OrderLineRequest],
    discount: Money,
    shipping_fee: Money,
) -> Result<OrderTotals> {
    if discount.is_negative() {
        return Err(OrderError::validation("discount must not be negative"));
    }
    if shipping_fee.is_negative() {
        return Err(OrderError::validation("shipping fee must not be negative"));
    }

    let overflow = || OrderError::validation("order amount overflows");

    let line_totals = lines
        .iter()
        .map(|line| line.unit_price.checked_multiply(line.quantity).ok_or_else(overflow))
        .collect::<Result<Vec<_>>>()?;

    let total_amount = line_totals
        .iter()
        .try_fold(Money::zero(), |acc, total| acc.checked_add(*total))
        .ok_or_else(overflow)?;

    let gross = total_amount.checked_add(shipping_fee).ok_or_else(overflow)?;
    if discount > gross {
        return Err(OrderError::validation(format!(
            "discount {discount} exceeds order total {gross}"
        )));
    }

    Ok(OrderTotals {
        line_totals,
        total_amount,
        discount,
        shipping_fee,
        total_paid: gross - discount,
    })
}
