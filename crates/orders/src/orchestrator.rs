//! Atomic order creation across stock, orders, payments and audit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use common::{ActorId, Money, OrderId, PaymentMethodRef, ProductId, TenantId};
use serde_json::json;
use tenancy::{ConnectionFactory, DirectoryLookup, TenantRegistry};
use uuid::Uuid;

use crate::audit::{AuditSink, ScopedAuditSink};
use crate::error::{OrderError, Result};
use crate::inventory::InventoryGuard;
use crate::model::{
    AuditAction, AuditEvent, OrderAggregate, OrderLine, OrderRequest, PaymentRecord,
    PaymentStatus, generate_order_code,
};
use crate::payment::{PaymentCollaborator, PaymentReceipt};
use crate::scope::{OrderScope, TenantStore};
use crate::status::OrderStatus;
use crate::totals::{OrderTotals, compute_totals};

/// Orchestrator settings.
///
/// Reads from environment variables:
/// - `ORDER_PAYMENT_TIMEOUT_SECS` — bound on one payment capture (default: `15`)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub payment_timeout: Duration,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let payment_timeout = std::env::var("ORDER_PAYMENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Self::default().payment_timeout);
        Self { payment_timeout }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(15),
        }
    }
}

/// Creates orders atomically on tenant databases.
///
/// Stock decrements, the order and its lines, the payment record and the
/// audit trail are written in one scope on the handle the registry returns.
/// Any failure rolls the scope back and surfaces a classified `OrderError`.
pub struct OrderOrchestrator<D, F, P, A = ScopedAuditSink>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
    F::Handle: TenantStore,
    P: PaymentCollaborator,
    A: AuditSink,
{
    registry: TenantRegistry<D, F>,
    payments: P,
    audit: A,
    inventory: InventoryGuard,
    config: OrchestratorConfig,
}

impl<D, F, P> OrderOrchestrator<D, F, P>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
    F::Handle: TenantStore,
    P: PaymentCollaborator,
{
    /// Creates an orchestrator that audits into the tenant database.
    pub fn new(registry: TenantRegistry<D, F>, payments: P) -> Self {
        Self {
            registry,
            payments,
            audit: ScopedAuditSink,
            inventory: InventoryGuard::new(),
            config: OrchestratorConfig::default(),
        }
    }
}

impl<D, F, P, A> OrderOrchestrator<D, F, P, A>
where
    D: DirectoryLookup,
    F: ConnectionFactory,
    F::Handle: TenantStore,
    P: PaymentCollaborator,
    A: AuditSink,
{
    /// Replaces the audit sink.
    pub fn with_audit_sink<B: AuditSink>(self, audit: B) -> OrderOrchestrator<D, F, P, B> {
        OrderOrchestrator {
            registry: self.registry,
            payments: self.payments,
            audit,
            inventory: self.inventory,
            config: self.config,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &TenantRegistry<D, F> {
        &self.registry
    }

    /// Validates, decrements stock, persists the order, captures payment and
    /// records audit events as one atomic unit on the tenant's database.
    ///
    /// Request shape, actor and payment method are checked before any
    /// database work. On success the committed order is returned with its lines.
    #[tracing::instrument(
        skip(self, request, payment_method),
        fields(%tenant_id, %actor_id, lines = request.lines.len())
    )]
    pub async fn create_order_atomic(
        &self,
        tenant_id: TenantId,
        request: OrderRequest,
        actor_id: &ActorId,
        payment_method: &PaymentMethodRef,
    ) -> Result<OrderAggregate> {
        let started = std::time::Instant::now();
        let result = self
            .create_order(tenant_id, &request, actor_id, payment_method)
            .await;
        metrics::histogram!("order_creation_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(order) => {
                metrics::counter!("orders_created_total").increment(1);
                tracing::info!(
                    order_id = %order.id,
                    code = %order.code,
                    total_paid = %order.total_paid,
                    "order created"
                );
            }
            Err(e) => {
                metrics::counter!("orders_failed_total", "kind" => e.kind()).increment(1);
                tracing::warn!(kind = e.kind(), error = %e, "order creation failed");
            }
        }
        result
    }

    async fn create_order(
        &self,
        tenant_id: TenantId,
        request: &OrderRequest,
        actor_id: &ActorId,
        payment_method: &PaymentMethodRef,
    ) -> Result<OrderAggregate> {
        // 1. Cheap checks before touching any database
        if actor_id.is_blank() {
            return Err(OrderError::validation("actor is required"));
        }
        if payment_method.is_blank() {
            return Err(OrderError::validation("payment method is required"));
        }
        request.validate()?;
        let totals = compute_totals(&request.lines, request.discount, request.shipping_fee)?;

        // 2. Tenant handle and transactional scope
        let store = self.registry.acquire(tenant_id).await?;
        let mut scope = store.begin().await?;

        // 3. Every effect inside the scope; roll back on any failure
        let outcome = self
            .run_in_scope(scope.as_mut(), request, &totals, actor_id, payment_method)
            .await;
        let written = match outcome {
            Ok(order) => order,
            Err(cause) => return Err(Self::roll_back(scope, cause).await),
        };

        // 4. Commit
        if let Err(e) = scope.commit().await {
            if matches!(e, OrderError::Transaction(_)) {
                tracing::error!(order_id = %written.id, error = %e, "order commit failed");
            }
            return Err(e);
        }

        // 5. Reload what was committed
        match store.load_order(written.id).await {
            Ok(Some(order)) => Ok(order),
            Ok(None) => {
                tracing::warn!(order_id = %written.id, "committed order not visible on reload");
                Ok(written)
            }
            Err(e) => {
                tracing::warn!(order_id = %written.id, error = %e, "order reload failed");
                Ok(written)
            }
        }
    }

    async fn run_in_scope(
        &self,
        scope: &mut dyn OrderScope,
        request: &OrderRequest,
        totals: &OrderTotals,
        actor_id: &ActorId,
        payment_method: &PaymentMethodRef,
    ) -> Result<OrderAggregate> {
        // Stock validation, then decrement under row locks
        self.inventory.validate(scope, &request.lines).await?;
        let changes = self.inventory.decrement(scope, &request.lines).await?;
        let remaining: HashMap<ProductId, i64> = changes
            .into_iter()
            .map(|c| (c.product_id, c.remaining))
            .collect();

        // Order header and lines
        let order = build_order(request, totals, actor_id);
        scope.insert_order(&order).await?;

        // Payment capture and record
        let receipt = self.capture(totals.total_paid, payment_method).await?;
        let payment = PaymentRecord {
            id: Uuid::new_v4(),
            order_id: order.id,
            amount: totals.total_paid,
            payment_method: payment_method.clone(),
            provider_reference: receipt.reference,
            actor_id: actor_id.clone(),
            status: PaymentStatus::Captured,
            created_at: Utc::now(),
        };
        scope.insert_payment(&payment).await?;

        // Audit trail
        self.audit
            .record(
                AuditEvent::new(
                    actor_id.clone(),
                    AuditAction::OrderCreated,
                    "orders",
                    order.id,
                    json!({
                        "code": order.code,
                        "total_amount": order.total_amount.cents(),
                        "total_paid": order.total_paid.cents(),
                        "lines": order.lines.len(),
                    }),
                ),
                scope,
            )
            .await?;

        for line in &order.lines {
            self.audit
                .record(
                    AuditEvent::new(
                        actor_id.clone(),
                        AuditAction::StockDecremented,
                        "products",
                        &line.product_id,
                        json!({
                            "order_id": order.id,
                            "position": line.position,
                            "quantity": line.quantity,
                            "remaining": remaining.get(&line.product_id),
                        }),
                    ),
                    scope,
                )
                .await?;
        }

        self.audit
            .record(
                AuditEvent::new(
                    actor_id.clone(),
                    AuditAction::PaymentCaptured,
                    "payments",
                    payment.id,
                    json!({
                        "order_id": order.id,
                        "amount": payment.amount.cents(),
                        "payment_method": payment.payment_method,
                        "provider_reference": payment.provider_reference,
                    }),
                ),
                scope,
            )
            .await?;

        Ok(order)
    }

    /// Captures payment, treating a timeout or any collaborator failure as
    /// a payment failure.
    async fn capture(
        &self,
        amount: Money,
        payment_method: &PaymentMethodRef,
    ) -> Result<PaymentReceipt> {
        let timeout = self.config.payment_timeout;
        match tokio::time::timeout(timeout, self.payments.capture(amount, payment_method)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(OrderError::Payment(reason))) => Err(OrderError::Payment(reason)),
            Ok(Err(other)) => Err(OrderError::Payment(other.to_string())),
            Err(_) => Err(OrderError::Payment(format!(
                "capture timed out after {timeout:?}"
            ))),
        }
    }

    /// Rolls back and returns the error to surface.
    async fn roll_back(scope: Box<dyn OrderScope>, cause: OrderError) -> OrderError {
        match scope.rollback().await {
            Ok(()) => {
                tracing::debug!(kind = cause.kind(), "order scope rolled back");
                cause
            }
            Err(e) => {
                tracing::error!(error = %e, cause = %cause, "order rollback failed");
                OrderError::Transaction(format!("rollback failed after {cause}: {e}"))
            }
        }
    }
}

fn build_order(request: &OrderRequest, totals: &OrderTotals, actor_id: &ActorId) -> OrderAggregate {
    let created_at = Utc::now();
    let lines = request
        .lines
        .iter()
        .zip(&totals.line_totals)
        .enumerate()
        .map(|(position, (line, line_total))| OrderLine {
            position: position as u32,
            product_id: line.product_id.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            line_total: *line_total,
        })
        .collect();

    OrderAggregate {
        id: OrderId::new(),
        code: request
            .code
            .clone()
            .unwrap_or_else(|| generate_order_code(created_at)),
        customer_id: request.customer_id.clone(),
        status: OrderStatus::Pending,
        total_amount: totals.total_amount,
        discount: totals.discount,
        shipping_fee: totals.shipping_fee,
        total_paid: totals.total_paid,
        delivery_address: request.delivery_address.clone(),
        created_by: actor_id.clone(),
        created_at,
        deleted_at: None,
        lines,
    }
}
