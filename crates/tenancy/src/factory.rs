//! Connection factory and handle traits.

use async_trait::async_trait;

use crate::{DatabaseId, Result};

/// An open, reusable connection to one tenant database.
///
/// Handles are cloned out of the registry to every caller, so clones
/// must share the same underlying connection (typically a pool).
#[async_trait]
pub trait TenantHandle: Clone + Send + Sync + 'static {
    /// Returns true once the handle can no longer serve requests.
    fn is_closed(&self) -> bool;

    /// Closes the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// Trait for opening handles to tenant databases.
///
/// `open` connects, applies any schema sync, and configures pool
/// parameters. If it fails part way through it must release whatever
/// it already opened before returning the error.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Handle: TenantHandle;

    async fn open(&self, database_id: &DatabaseId) -> Result<Self::Handle>;
}
