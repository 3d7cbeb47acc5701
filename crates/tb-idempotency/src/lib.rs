//! Idempotency keys for client-initiated writes.
//!
//! A key is scoped to a tenant and moves through
//! `Started -> Completed`, or is removed so a retry can start clean.
//! Reusing a key with a different request fingerprint is a conflict.

pub mod guard;
pub mod memory;
pub mod postgres;

pub use guard::{request_hash, GuardPolicy, KeyHeader, ResponseDisposition};
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tb_common::{DataError, TenantResolution};
use tb_tenancy::TenancyError;
use thiserror::Error;

/// Stored outcome of a completed request, replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub status: u16,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of claiming a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStart {
    /// Caller owns the key and must run the operation
    Started,
    /// Same request already finished; replay the record
    Completed(IdempotencyRecord),
    /// Same request is running elsewhere
    InProgress,
    /// Key was used for a different request
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyCompletion {
    pub key: String,
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    #[error(transparent)]
    Data(#[from] DataError),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `(tenant, key)` for `request_hash`. Exactly one concurrent
    /// caller observes `Started`.
    async fn try_start(
        &self,
        tenant: &TenantResolution,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyStart>;

    /// Records the response. Repeating it overwrites with the same values.
    async fn complete(&self, tenant: &TenantResolution, completion: &IdempotencyCompletion) -> Result<()>;

    /// Forgets the key so a retry can start over.
    async fn remove(&self, tenant: &TenantResolution, key: &str) -> Result<()>;
}
