//! Tenant routing.
//!
//! - `TenantCatalog`: authoritative registry of tenants and their databases
//! - `TenantCache`: short-TTL host lookup cache (Redis, in-memory or none)
//! - `TenantResolver`: host -> tenant, cache first with catalog fallback
//! - `TenantConnectionProvider`: pooled connections with `app.tenant_id` set
//! - `TenantContext`: request-scoped resolution passed explicitly

pub mod cache;
pub mod catalog;
pub mod connection;
pub mod context;
pub mod resolver;

pub use cache::{InMemoryTenantCache, NullTenantCache, RedisTenantCache, TenantCache};
pub use catalog::{PgTenantCatalog, StaticTenantCatalog, TenantCatalog};
pub use connection::{ConnectOptionsFactory, TenantConnection, TenantConnectionProvider};
pub use context::TenantContext;
pub use resolver::{normalize_host, TenantResolver};

use tb_common::{DataError, TenantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("Tenant context has not been resolved")]
    Unresolved,

    #[error("Isolated tenant {0} has no database mapping")]
    MissingDatabaseMapping(TenantId),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Tenant cache unavailable: {0}")]
    Cache(String),
}

pub type Result<T> = std::result::Result<T, TenancyError>;
