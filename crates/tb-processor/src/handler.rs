use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tb_common::QueueEnvelope;
use tracing::{info, warn};

/// Processes envelopes of one message type.
///
/// Handlers must tolerate redelivery: a message is deleted only after
/// `handle` returns `Ok`, so a crash or error means it will be seen again.
#[async_trait]
pub trait QueueMessageHandler: Send + Sync {
    fn message_type(&self) -> &str;

    async fn handle(&self, envelope: &QueueEnvelope) -> anyhow::Result<()>;
}

fn registry_key(message_type: &str) -> String {
    message_type.trim().to_lowercase()
}

/// Case-insensitive message type lookup. The first handler registered for a
/// type wins; later ones are recorded as duplicates.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn QueueMessageHandler>>,
    duplicates: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_handlers(handlers: impl IntoIterator<Item = Arc<dyn QueueMessageHandler>>) -> Self {
        let mut registry = Self::new();
        for handler in handlers {
            registry.register(handler);
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn QueueMessageHandler>) -> &mut Self {
        let key = registry_key(handler.message_type());
        if key.is_empty() {
            warn!("Ignoring queue handler with an empty message type");
            return self;
        }

        if self.handlers.contains_key(&key) {
            warn!(message_type = %key, "Duplicate queue handler registration, keeping the first");
            if !self.duplicates.contains(&key) {
                self.duplicates.push(key);
            }
            return self;
        }

        self.handlers.insert(key, handler);
        self
    }

    pub fn get(&self, message_type: &str) -> Option<&Arc<dyn QueueMessageHandler>> {
        self.handlers.get(&registry_key(message_type))
    }

    /// Registered types, sorted.
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Types that had more than one registration.
    pub fn duplicate_types(&self) -> &[String] {
        &self.duplicates
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs and counts `sample` messages.
#[derive(Default)]
pub struct SampleHandler {
    handled: AtomicU64,
}

impl SampleHandler {
    pub const MESSAGE_TYPE: &'static str = "sample";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueMessageHandler for SampleHandler {
    fn message_type(&self) -> &str {
        Self::MESSAGE_TYPE
    }

    async fn handle(&self, envelope: &QueueEnvelope) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::Relaxed);
        info!(
            tenant_id = %envelope.tenant_id,
            outbox_id = %envelope.outbox_id,
            payload_bytes = envelope.payload.len(),
            "Handled sample message"
        );
        Ok(())
    }
}
