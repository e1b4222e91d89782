//! PostgreSQL tenant storage.
//!
//! The tenant handle is the `PgPool` the registry caches; each scope is one
//! database transaction. Stock rows are locked with `SELECT ... FOR UPDATE`.

use async_trait::async_trait;
use common::{ActorId, Money, OrderId, ProductId};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::model::{AuditEvent, OrderAggregate, OrderLine, PaymentRecord};
use crate::scope::{OrderScope, TenantStore};
use crate::status::OrderStatus;

/// Schema for tenant databases (products, orders, payments, audit events).
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations/tenant");

fn row_to_order(row: &PgRow, lines: Vec<OrderLine>) -> Result<OrderAggregate> {
    let status: String = row.try_get("status")?;
    Ok(OrderAggregate {
        id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
        code: row.try_get("code")?,
        customer_id: row.try_get("customer_id")?,
        status: status.parse().map_err(OrderError::Transaction)?,
        total_amount: Money::from_cents(row.try_get("total_amount")?),
        discount: Money::from_cents(row.try_get("discount")?),
        shipping_fee: Money::from_cents(row.try_get("shipping_fee")?),
        total_paid: Money::from_cents(row.try_get("total_paid")?),
        delivery_address: row.try_get("delivery_address")?,
        created_by: ActorId::new(row.try_get::<String, _>("created_by")?),
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
        lines,
    })
}

fn row_to_line(row: &PgRow) -> Result<OrderLine> {
    let position: i32 = row.try_get("position")?;
    let quantity: i32 = row.try_get("quantity")?;
    Ok(OrderLine {
        position: u32::try_from(position)
            .map_err(|_| OrderError::Transaction(format!("invalid line position {position}")))?,
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        quantity: u32::try_from(quantity)
            .map_err(|_| OrderError::Transaction(format!("invalid line quantity {quantity}")))?,
        unit_price: Money::from_cents(row.try_get("unit_price")?),
        line_total: Money::from_cents(row.try_get("line_total")?),
    })
}

fn to_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| OrderError::validation(format!("{what} {value} is too large")))
}

#[async_trait]
impl TenantStore for PgPool {
    async fn begin(&self) -> Result<Box<dyn OrderScope>> {
        let tx = sqlx::Pool::begin(self)
            .await
            .map_err(|e| OrderError::Connection(format!("could not begin transaction: {e}")))?;
        Ok(Box::new(PgOrderScope { tx }))
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<OrderAggregate>> {
        let Some(header) = sqlx::query(
            r#"
            SELECT id, code, customer_id, status, total_amount, discount, shipping_fee,
                   total_paid, delivery_address, created_by, created_at, deleted_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(self)
        .await?
        else {
            return Ok(None);
        };

        let lines = sqlx::query(
            r#"
            SELECT position, product_id, quantity, unit_price, line_total
            FROM order_lines
            WHERE order_id = $1
            ORDER BY position
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(self)
        .await?
        .iter()
        .map(row_to_line)
        .collect::<Result<Vec<_>>>()?;

        row_to_order(&header, lines).map(Some)
    }

    async fn stock_level(&self, product_id: &ProductId) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT stock_quantity FROM products WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(product_id.as_str())
        .fetch_optional(self)
        .await?)
    }
}

/// One open transaction on a tenant database.
pub struct PgOrderScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderScope for PgOrderScope {
    async fn read_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT stock_quantity FROM products WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(product_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn lock_stock(&mut self, product_id: &ProductId) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT stock_quantity FROM products WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(product_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?)
    }

    async fn decrement_stock(&mut self, product_id: &ProductId, quantity: i64) -> Result<i64> {
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $2
            WHERE id = $1 AND deleted_at IS NULL AND stock_quantity >= $2
            RETURNING stock_quantity
            "#,
        )
        .bind(product_id.as_str())
        .bind(quantity)
        .fetch_optional(&mut *self.tx)
        .await?;

        match remaining {
            Some(remaining) => Ok(remaining),
            None => match self.read_stock(product_id).await? {
                Some(available) => Err(OrderError::InsufficientStock {
                    product_id: product_id.clone(),
                    requested: quantity,
                    available,
                }),
                None => Err(OrderError::NotFound(format!("product {product_id}"))),
            },
        }
    }

    async fn insert_order(&mut self, order: &OrderAggregate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, code, customer_id, status, total_amount, discount,
                                shipping_fee, total_paid, delivery_address, created_by,
                                created_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(&order.code)
        .bind(&order.customer_id)
        .bind(order.status.as_str())
        .bind(order.total_amount.cents())
        .bind(order.discount.cents())
        .bind(order.shipping_fee.cents())
        .bind(order.total_paid.cents())
        .bind(&order.delivery_address)
        .bind(order.created_by.as_str())
        .bind(order.created_at)
        .bind(order.deleted_at)
        .execute(&mut *self.tx)
        .await?;

        for line in &order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, position, product_id, quantity,
                                         unit_price, line_total)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(to_i32(line.position, "line position")?)
            .bind(line.product_id.as_str())
            .bind(to_i32(line.quantity, "quantity")?)
            .bind(line.unit_price.cents())
            .bind(line.line_total.cents())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, amount, payment_method, provider_reference,
                                  actor_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(payment.id)
        .bind(payment.order_id.as_uuid())
        .bind(payment.amount.cents())
        .bind(payment.payment_method.as_str())
        .bind(&payment.provider_reference)
        .bind(payment.actor_id.as_str())
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_audit_event(&mut self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, actor_id, action, target_table, target_id,
                                      metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.actor_id.as_str())
        .bind(event.action.as_str())
        .bind(&event.target_table)
        .bind(&event.target_id)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| OrderError::Transaction(format!("commit failed: {e}")))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| OrderError::Transaction(format!("rollback failed: {e}")))
    }
}
