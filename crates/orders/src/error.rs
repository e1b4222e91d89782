//! Order orchestration error types.

use common::ProductId;
use tenancy::RegistryError;
use thiserror::Error;

/// Errors surfaced by atomic order creation.
///
/// Every failure is classified into one of these kinds before it reaches the
/// caller. Nothing is partially committed when any of them is returned.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Tenant, product or order does not exist (or is not usable).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is malformed or conflicts with existing data.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requested quantity exceeds stock on hand at decrement time.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// The tenant database could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payment capture was declined, failed or timed out.
    #[error("Payment failed: {0}")]
    Payment(String),

    /// Commit or rollback failed, or storage failed mid-scope.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl OrderError {
    /// Stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            OrderError::NotFound(_) => "not_found",
            OrderError::Validation(_) => "validation",
            OrderError::InsufficientStock { .. } => "insufficient_stock",
            OrderError::Connection(_) => "connection",
            OrderError::Payment(_) => "payment",
            OrderError::Transaction(_) => "transaction",
        }
    }

    /// Returns true if the caller may retry the identical request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderError::Connection(_))
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        OrderError::Validation(reason.into())
    }
}

impl From<RegistryError> for OrderError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => OrderError::NotFound(err.to_string()),
            other => OrderError::Connection(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for OrderError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => OrderError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                let target = db.constraint().unwrap_or("unique key");
                OrderError::Validation(format!("conflict on {target}"))
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                OrderError::NotFound(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_check_violation() => {
                OrderError::Validation(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                OrderError::Connection(err.to_string())
            }
            _ => OrderError::Transaction(err.to_string()),
        }
    }
}

/// Convenience type alias for order results.
pub type Result<T> = std::result::Result<T, OrderError>;
