//! Transactional outbox.
//!
//! - `OutboxWriter`: appends an event inside the caller's transaction
//! - `OutboxStore`: claims pending rows per tenant and records outcomes
//! - `OutboxDispatcher`: polls active tenants and publishes their rows

pub mod dispatcher;
pub mod memory;
pub mod postgres;
pub mod writer;

pub use dispatcher::{DispatchSummary, DispatcherConfig, OutboxDispatcher};
pub use memory::{InMemoryOutboxStore, InMemoryOutboxTransaction};
pub use postgres::PgOutboxStore;
pub use writer::OutboxWriter;

use async_trait::async_trait;
use std::time::Duration;
use tb_common::{DataError, OutboxMessage, OutboxRecord, TenantCatalogEntry};
use tb_queue::QueueError;
use tb_tenancy::TenancyError;
use thiserror::Error;
use uuid::Uuid;

/// Longest `last_error` text kept on a row.
pub const MAX_ERROR_LENGTH: usize = 2000;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Invalid outbox message: {0}")]
    Validation(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `batch_size` due rows, oldest first, incrementing their
    /// attempt counter. Concurrent callers never receive the same row.
    async fn dequeue_pending(&self, tenant: &TenantCatalogEntry, batch_size: u32) -> Result<Vec<OutboxRecord>>;

    async fn mark_dispatched(&self, tenant: &TenantCatalogEntry, outbox_id: Uuid) -> Result<()>;

    /// Records the error and hides the row for `retry_delay`.
    async fn mark_failed(
        &self,
        tenant: &TenantCatalogEntry,
        outbox_id: Uuid,
        error: &str,
        retry_delay: Duration,
    ) -> Result<()>;
}

pub(crate) fn validate(message: &OutboxMessage) -> Result<()> {
    if message.queue_name.trim().is_empty() {
        return Err(OutboxError::Validation("queue name is required".to_string()));
    }
    if message.message_type.trim().is_empty() {
        return Err(OutboxError::Validation("message type is required".to_string()));
    }
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&message.payload) {
        return Err(OutboxError::Validation(format!("payload is not JSON: {}", e)));
    }
    Ok(())
}

pub(crate) fn truncate_error(error: &str) -> &str {
    match error.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((index, _)) => &error[..index],
        None => error,
    }
}
