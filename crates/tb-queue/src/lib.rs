//! Queue transport.
//!
//! - `QueueClient`: send / receive-with-visibility / delete over a backend
//! - `QueuePublisher`: envelope publishing used by the outbox dispatcher
//! - `QueueNaming`: prefixing and poison queue names
//!
//! Backends: `MemoryQueue` (always), `SqliteQueue` (feature `sqlite`),
//! `SqsQueue` (feature `sqs`).

pub mod memory;
pub mod naming;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqs")]
pub mod sqs;

pub use memory::MemoryQueue;
pub use naming::{QueueNaming, POISON_SUFFIX};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueue;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueue;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tb_common::QueueEnvelope;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Invalid queue name: {0:?}")]
    InvalidName(String),

    #[error("Stale receipt for message {0}")]
    StaleReceipt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A message leased from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Proof of the current lease, required to delete
    pub receipt_handle: String,
    /// Deliveries including this one
    pub dequeue_count: u32,
    pub body: String,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    fn identifier(&self) -> &str;

    /// Sends `body` to `queue`, creating the queue if needed. Returns the message id.
    async fn send(&self, queue: &str, body: &str, time_to_live: Option<Duration>) -> Result<String>;

    /// Leases up to `max_messages`; they stay hidden for `visibility_timeout`.
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledges a leased message. Deleting an already-deleted message succeeds.
    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()>;
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publishes to the named queue. Returns the backend message id.
    async fn publish(&self, queue_name: &str, envelope: &QueueEnvelope) -> Result<String>;

    /// Publishes to the poison sibling of the named queue.
    async fn publish_poison(&self, queue_name: &str, envelope: &QueueEnvelope) -> Result<String>;
}

/// Serializes envelopes and sends them through a `QueueClient`.
pub struct EnvelopePublisher {
    client: Arc<dyn QueueClient>,
    naming: QueueNaming,
    poison_ttl: Option<Duration>,
}

impl EnvelopePublisher {
    pub fn new(client: Arc<dyn QueueClient>, naming: QueueNaming) -> Self {
        Self {
            client,
            naming,
            poison_ttl: None,
        }
    }

    pub fn with_poison_ttl(mut self, ttl: Duration) -> Self {
        self.poison_ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl QueuePublisher for EnvelopePublisher {
    async fn publish(&self, queue_name: &str, envelope: &QueueEnvelope) -> Result<String> {
        let queue = self.naming.resolve(queue_name)?;
        let body = envelope.to_json()?;
        let id = self.client.send(&queue, &body, None).await?;
        debug!(queue = %queue, outbox_id = %envelope.outbox_id, message_id = %id, "Published envelope");
        Ok(id)
    }

    async fn publish_poison(&self, queue_name: &str, envelope: &QueueEnvelope) -> Result<String> {
        let queue = self.naming.resolve_poison(queue_name)?;
        let body = envelope.to_json()?;
        self.client.send(&queue, &body, self.poison_ttl).await
    }
}
