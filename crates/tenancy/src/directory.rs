//! Directory lookup: resolves a tenant to its physical database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{DatabaseId, Result, TenantId};

/// A tenant's directory record. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub database_id: DatabaseId,
    pub is_active: bool,
    pub is_deleted: bool,
}

impl TenantRecord {
    /// Creates an active, non-deleted record.
    pub fn active(tenant_id: TenantId, database_id: impl Into<DatabaseId>) -> Self {
        Self {
            tenant_id,
            database_id: database_id.into(),
            is_active: true,
            is_deleted: false,
        }
    }

    /// Returns the reason this record cannot be used, if any.
    ///
    /// A database id is only usable when the tenant is active,
    /// not soft-deleted, and the id itself is not blank.
    pub fn unusable_reason(&self) -> Option<&'static str> {
        if !self.is_active {
            Some("tenant is inactive")
        } else if self.is_deleted {
            Some("tenant is deleted")
        } else if self.database_id.is_blank() {
            Some("tenant has no database")
        } else {
            None
        }
    }
}

/// Trait for resolving tenants through the directory.
///
/// Implementations fail with `RegistryError::NotFound` when the tenant
/// does not exist. Liveness flags are checked by the registry.
#[async_trait]
pub trait DirectoryLookup: Send + Sync + 'static {
    async fn resolve(&self, tenant_id: TenantId) -> Result<TenantRecord>;
}
