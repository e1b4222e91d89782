//! Audit sinks that write inside the caller's transactional scope.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::AuditEvent;
use crate::scope::OrderScope;

/// Destination for audit events.
///
/// Events are recorded through the scope the orchestrator is using, so they
/// commit or roll back together with the change they describe.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent, scope: &mut dyn OrderScope) -> Result<()>;
}

/// Writes events to the tenant's `audit_events` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopedAuditSink;

#[async_trait]
impl AuditSink for ScopedAuditSink {
    async fn record(&self, event: AuditEvent, scope: &mut dyn OrderScope) -> Result<()> {
        tracing::trace!(action = %event.action, target_id = %event.target_id, "audit event");
        scope.insert_audit_event(&event).await
    }
}
