use crate::HandlerRegistry;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tb_common::{QueueEnvelope, ENVELOPE_SCHEMA_VERSION};
use tb_config::ProcessorSettings;
use tb_queue::{QueueClient, QueueNaming, ReceivedMessage, Result};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

/// Configuration for the queue processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Logical queue names, resolved through `QueueNaming`
    pub queues: Vec<String>,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is poisoned unprocessed
    pub max_dequeue_count: u32,
    /// Retention of messages in poison queues
    pub poison_ttl: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&ProcessorSettings::default())
    }
}

impl From<&ProcessorSettings> for ProcessorConfig {
    fn from(settings: &ProcessorSettings) -> Self {
        Self {
            queues: settings.queues.clone(),
            batch_size: settings.effective_batch_size(),
            poll_interval: settings.poll_delay(),
            visibility_timeout: settings.visibility_timeout(),
            max_dequeue_count: settings.max_dequeue_count.max(1),
            poison_ttl: settings.poison_message_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonReason {
    MaxDequeueCount,
    DeserializeFailed,
    UnsupportedSchemaVersion,
    HandlerMissing,
}

impl PoisonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDequeueCount => "max_dequeue_count",
            Self::DeserializeFailed => "deserialize_failed",
            Self::UnsupportedSchemaVersion => "unsupported_schema_version",
            Self::HandlerMissing => "handler_missing",
        }
    }
}

impl std::fmt::Display for PoisonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Handler succeeded and the message was deleted
    Processed,
    /// Copied to the poison queue and deleted
    Poisoned(PoisonReason),
    /// Handler failed; the message reappears after the visibility timeout
    HandlerFailed,
}

/// Counts for one processor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub received: usize,
    pub processed: usize,
    pub poisoned: usize,
    pub handler_failed: usize,
    /// Receive, poison or delete calls that failed
    pub errors: usize,
}

/// Receives from each configured queue and dispatches to registered handlers.
pub struct QueueProcessor {
    client: Arc<dyn QueueClient>,
    registry: Arc<HandlerRegistry>,
    queues: Vec<String>,
    config: ProcessorConfig,
}

impl QueueProcessor {
    /// Fails if a configured queue name is blank.
    pub fn new(
        client: Arc<dyn QueueClient>,
        naming: &QueueNaming,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        let mut queues = Vec::with_capacity(config.queues.len());
        for queue in &config.queues {
            let resolved = naming.resolve(queue)?;
            if !queues.contains(&resolved) {
                queues.push(resolved);
            }
        }

        Ok(Self {
            client,
            registry,
            queues,
            config,
        })
    }

    /// Backend queue names this processor polls.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if self.queues.is_empty() {
            warn!("No queues configured, queue processor idle");
        }
        info!(
            queues = ?self.queues,
            batch_size = self.config.batch_size,
            visibility_timeout_secs = self.config.visibility_timeout.as_secs(),
            max_dequeue_count = self.config.max_dequeue_count,
            handlers = ?self.registry.message_types(),
            backend = self.client.identifier(),
            "Starting queue processor"
        );

        loop {
            tokio::select! {
                summary = self.tick() => {
                    if summary.received > 0 {
                        debug!(?summary, "Queue processor tick complete");
                    }
                }
                _ = shutdown.recv() => break,
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Queue processor stopped");
    }

    /// One receive pass over every queue. Failures are counted, never raised.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        for queue in &self.queues {
            let messages = match self
                .client
                .receive(queue, self.config.batch_size, self.config.visibility_timeout)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    summary.errors += 1;
                    error!(queue = %queue, error = %e, "Failed to receive from queue");
                    continue;
                }
            };
            summary.received += messages.len();

            for message in &messages {
                match self.process_message(queue, message).await {
                    Ok(MessageOutcome::Processed) => summary.processed += 1,
                    Ok(MessageOutcome::Poisoned(_)) => summary.poisoned += 1,
                    Ok(MessageOutcome::HandlerFailed) => summary.handler_failed += 1,
                    Err(e) => {
                        summary.errors += 1;
                        error!(
                            queue = %queue,
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to settle queue message"
                        );
                    }
                }
            }
        }

        summary
    }

    /// Applies the poison rules in order, then runs the handler.
    pub async fn process_message(&self, queue: &str, message: &ReceivedMessage) -> Result<MessageOutcome> {
        let span = info_span!(
            "queue_message",
            queue = %queue,
            message_id = %message.message_id,
            dequeue_count = message.dequeue_count,
            tenant_id = field::Empty,
            outbox_id = field::Empty,
            message_type = field::Empty,
            correlation_id = field::Empty,
        );
        self.settle(queue, message).instrument(span).await
    }

    async fn settle(&self, queue: &str, message: &ReceivedMessage) -> Result<MessageOutcome> {
        if message.dequeue_count >= self.config.max_dequeue_count {
            return self.poison(queue, message, PoisonReason::MaxDequeueCount).await;
        }

        let envelope = match QueueEnvelope::from_json(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Queue message is not a valid envelope");
                return self.poison(queue, message, PoisonReason::DeserializeFailed).await;
            }
        };

        let span = Span::current();
        span.record("tenant_id", field::display(envelope.tenant_id));
        span.record("outbox_id", field::display(envelope.outbox_id));
        span.record("message_type", envelope.message_type.as_str());
        if let Some(correlation_id) = &envelope.correlation_id {
            span.record("correlation_id", correlation_id.as_str());
        }

        if envelope.schema_version > ENVELOPE_SCHEMA_VERSION {
            warn!(schema_version = envelope.schema_version, "Unsupported envelope schema version");
            return self.poison(queue, message, PoisonReason::UnsupportedSchemaVersion).await;
        }

        let Some(handler) = self.registry.get(&envelope.message_type) else {
            return self.poison(queue, message, PoisonReason::HandlerMissing).await;
        };

        match handler.handle(&envelope).await {
            Ok(()) => {
                self.client.delete(queue, message).await?;
                counter!("tb_queue_processed_total").increment(1);
                debug!("Queue message processed");
                Ok(MessageOutcome::Processed)
            }
            Err(e) => {
                counter!("tb_queue_handler_failed_total").increment(1);
                warn!(error = %e, "Queue handler failed, message will be redelivered");
                Ok(MessageOutcome::HandlerFailed)
            }
        }
    }

    /// Copies the original body to the poison queue, then deletes the source.
    /// A crash between the two leads to reprocessing, never loss.
    async fn poison(&self, queue: &str, message: &ReceivedMessage, reason: PoisonReason) -> Result<MessageOutcome> {
        let poison_queue = QueueNaming::poison_of(queue);
        self.client
            .send(&poison_queue, &message.body, Some(self.config.poison_ttl))
            .await?;
        self.client.delete(queue, message).await?;

        counter!("tb_queue_poisoned_total", "reason" => reason.as_str()).increment(1);
        warn!(poison_queue = %poison_queue, reason = %reason, "Queue message poisoned");
        Ok(MessageOutcome::Poisoned(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = ProcessorSettings {
            queues: vec!["notes".to_string()],
            batch_size: 500,
            max_dequeue_count: 0,
            poison_message_ttl_days: 30,
            ..ProcessorSettings::default()
        };
        let config = ProcessorConfig::from(&settings);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_dequeue_count, 1);
        assert_eq!(config.poison_ttl, Duration::from_secs(7 * 24 * 60 * 60));
    }

    #[test]
    fn test_blank_queue_name_is_rejected() {
        let config = ProcessorConfig {
            queues: vec!["notes".to_string(), " ".to_string()],
            ..ProcessorConfig::default()
        };
        let result = QueueProcessor::new(
            Arc::new(tb_queue::MemoryQueue::default()),
            &QueueNaming::default(),
            Arc::new(HandlerRegistry::new()),
            config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_queue_names_are_resolved_and_deduplicated() {
        let config = ProcessorConfig {
            queues: vec!["Notes".to_string(), "notes".to_string(), "billing".to_string()],
            ..ProcessorConfig::default()
        };
        let processor = QueueProcessor::new(
            Arc::new(tb_queue::MemoryQueue::default()),
            &QueueNaming::new("prod"),
            Arc::new(HandlerRegistry::new()),
            config,
        )
        .unwrap();
        assert_eq!(processor.queues(), ["prod-notes".to_string(), "prod-billing".to_string()]);
    }
}
