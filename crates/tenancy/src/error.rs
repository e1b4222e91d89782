use std::time::Duration;

use thiserror::Error;

use crate::{DatabaseId, TenantId};

/// Errors that can occur when acquiring tenant handles.
///
/// The type is `Clone` because a single in-flight initialization result
/// is handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The tenant is unknown, inactive, soft-deleted, has no database,
    /// or the directory could not be read.
    #[error("Tenant not found: {tenant_id} ({reason})")]
    NotFound { tenant_id: TenantId, reason: String },

    /// The connection factory failed to open a handle.
    #[error("Failed to connect to tenant database {database_id}: {reason}")]
    Connection {
        database_id: DatabaseId,
        reason: String,
    },

    /// Opening the handle took longer than the configured connect timeout.
    #[error("Timed out after {timeout:?} connecting to tenant database {database_id}")]
    ConnectionTimeout {
        database_id: DatabaseId,
        timeout: Duration,
    },

    /// The registry has been shut down.
    #[error("Tenant registry is shut down")]
    ShutDown,
}

impl RegistryError {
    pub(crate) fn not_found(tenant_id: TenantId, reason: impl Into<String>) -> Self {
        RegistryError::NotFound {
            tenant_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(database_id: &DatabaseId, reason: impl ToString) -> Self {
        RegistryError::Connection {
            database_id: database_id.clone(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Connection { .. } | RegistryError::ConnectionTimeout { .. }
        )
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
