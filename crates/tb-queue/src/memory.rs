use crate::{QueueClient, QueueError, ReceivedMessage, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

struct StoredMessage {
    id: String,
    body: String,
    dequeue_count: u32,
    visible_at: Instant,
    expires_at: Option<Instant>,
    receipt: Option<String>,
}

/// In-process queue with visibility timeouts and per-message TTL.
///
/// Uses tokio's clock, so paused-time tests can advance visibility.
pub struct MemoryQueue {
    identifier: String,
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryQueue {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Messages in `queue`, visible or not.
    pub fn depth(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queues
            .lock()
            .get(queue)
            .map(|messages| messages.iter().filter(|m| !is_expired(m, now)).count())
            .unwrap_or(0)
    }

    /// Bodies in `queue` in arrival order.
    pub fn bodies(&self, queue: &str) -> Vec<String> {
        let now = Instant::now();
        self.queues
            .lock()
            .get(queue)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| !is_expired(m, now))
                    .map(|m| m.body.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_expired(message: &StoredMessage, now: Instant) -> bool {
    message.expires_at.is_some_and(|at| at <= now)
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, queue: &str, body: &str, time_to_live: Option<Duration>) -> Result<String> {
        let now = Instant::now();
        let id = Uuid::new_v4().to_string();
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push(StoredMessage {
                id: id.clone(),
                body: body.to_string(),
                dequeue_count: 0,
                visible_at: now,
                expires_at: time_to_live.map(|ttl| now + ttl),
                receipt: None,
            });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        messages.retain(|m| !is_expired(m, now));

        let mut received = Vec::new();
        for message in messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages as usize)
        {
            let receipt = Uuid::new_v4().to_string();
            message.dequeue_count += 1;
            message.visible_at = now + visibility_timeout;
            message.receipt = Some(receipt.clone());

            received.push(ReceivedMessage {
                message_id: message.id.clone(),
                receipt_handle: receipt,
                dequeue_count: message.dequeue_count,
                body: message.body.clone(),
            });
        }
        Ok(received)
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()> {
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(());
        };
        let Some(index) = messages.iter().position(|m| m.id == message.message_id) else {
            return Ok(());
        };
        if messages[index].receipt.as_deref() != Some(message.receipt_handle.as_str()) {
            return Err(QueueError::StaleReceipt(message.message_id.clone()));
        }
        messages.remove(index);
        Ok(())
    }
}
