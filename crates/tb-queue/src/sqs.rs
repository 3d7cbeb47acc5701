use crate::{QueueClient, QueueError, ReceivedMessage, Result};
use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SQS retention bounds, in seconds.
const MIN_RETENTION: u64 = 60;
const MAX_RETENTION: u64 = 14 * 24 * 60 * 60;

/// SQS receive and visibility limits.
const MAX_RECEIVE_BATCH: u32 = 10;
const MAX_VISIBILITY_SECONDS: u64 = 12 * 60 * 60;

/// Amazon SQS backend. Queues are created on first send.
///
/// SQS has no per-message TTL; a TTL on send sets the retention period of a
/// queue created by that send.
pub struct SqsQueue {
    client: Client,
    identifier: String,
    queue_urls: DashMap<String, String>,
}

fn backend(err: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(err.to_string())
}

impl SqsQueue {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            identifier: "sqs".to_string(),
            queue_urls: DashMap::new(),
        }
    }

    /// Builds a client from the default AWS environment, with an optional
    /// endpoint override (LocalStack, ElasticMQ).
    pub async fn from_env(endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url.filter(|e| !e.trim().is_empty()) {
            info!(endpoint = %endpoint, "Using SQS endpoint override");
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }

    async fn queue_url(&self, queue: &str, retention: Option<Duration>) -> Result<String> {
        if let Some(url) = self.queue_urls.get(queue) {
            return Ok(url.value().clone());
        }

        let existing = self.client.get_queue_url().queue_name(queue).send().await;
        let url = match existing {
            Ok(output) => output.queue_url().map(str::to_string),
            Err(e) => {
                debug!(queue = %queue, error = %e, "Queue lookup failed, creating queue");
                let mut request = self.client.create_queue().queue_name(queue);
                if let Some(retention) = retention {
                    let seconds = retention.as_secs().clamp(MIN_RETENTION, MAX_RETENTION);
                    request = request.attributes(QueueAttributeName::MessageRetentionPeriod, seconds.to_string());
                }
                let created = request.send().await.map_err(backend)?;
                info!(queue = %queue, "Created SQS queue");
                created.queue_url().map(str::to_string)
            }
        };

        let url = url.ok_or_else(|| QueueError::Backend(format!("no url returned for queue {}", queue)))?;
        self.queue_urls.insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, queue: &str, body: &str, time_to_live: Option<Duration>) -> Result<String> {
        let url = self.queue_url(queue, time_to_live).await?;
        let output = self
            .client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .send()
            .await
            .map_err(backend)?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let url = self.queue_url(queue, None).await?;
        let batch = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let visibility = visibility_timeout.as_secs().min(MAX_VISIBILITY_SECONDS);

        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(batch as i32)
            .visibility_timeout(visibility as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(backend)?;

        let mut received = Vec::new();
        for message in output.messages() {
            let (Some(id), Some(receipt)) = (message.message_id(), message.receipt_handle()) else {
                warn!(queue = %queue, "Skipping SQS message without id or receipt handle");
                continue;
            };
            let dequeue_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);

            received.push(ReceivedMessage {
                message_id: id.to_string(),
                receipt_handle: receipt.to_string(),
                dequeue_count,
                body: message.body().unwrap_or_default().to_string(),
            });
        }
        Ok(received)
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()> {
        let url = self.queue_url(queue, None).await?;
        self.client
            .delete_message()
            .queue_url(url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }
}
