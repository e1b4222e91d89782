//! Tenant connection registry.
//!
//! Each tenant's data lives in its own physical database, discovered
//! through a directory record. This crate caches one open handle per
//! database, coalesces concurrent opens, and reclaims handles by
//! capacity and idle time.

pub mod config;
pub mod directory;
pub mod error;
pub mod factory;
pub mod memory;
pub mod postgres;
pub mod registry;
mod sweeper;

pub use common::{DatabaseId, TenantId};
pub use config::RegistryConfig;
pub use directory::{DirectoryLookup, TenantRecord};
pub use error::{RegistryError, Result};
pub use factory::{ConnectionFactory, TenantHandle};
pub use memory::{InMemoryConnectionFactory, InMemoryDirectory, InMemoryHandle};
pub use postgres::{PgConnectionFactory, PgDirectory, PgFactoryConfig};
pub use registry::{EntryStats, RegistryStats, TenantRegistry};
