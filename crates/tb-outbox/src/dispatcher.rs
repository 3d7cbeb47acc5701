use crate::{OutboxStore, Result};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tb_common::{OutboxRecord, TenantCatalogEntry};
use tb_config::{BackoffKind, DispatcherSettings};
use tb_queue::QueuePublisher;
use tb_tenancy::TenantCatalog;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Configuration for the outbox dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Rows claimed per tenant per tick
    pub batch_size: u32,
    /// Sleep between ticks
    pub poll_interval: Duration,
    /// Delay before a failed row becomes due again
    pub retry_delay: Duration,
    /// Upper bound for exponential backoff
    pub max_retry_delay: Duration,
    pub backoff: BackoffKind,
    /// Publish attempts a row gets before it goes to the poison queue
    pub max_attempts: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&DispatcherSettings::default())
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            poll_interval: settings.poll_delay(),
            retry_delay: settings.retry_delay(),
            max_retry_delay: settings.max_retry_delay(),
            backoff: settings.backoff,
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

impl DispatcherConfig {
    /// Retry delay after the `attempts`-th failed publish.
    pub fn retry_delay_for(&self, attempts: i32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.retry_delay,
            BackoffKind::Exponential => {
                let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
                self.retry_delay
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(self.max_retry_delay)
            }
        }
    }
}

/// Counts for one dispatcher tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub tenants: usize,
    pub dispatched: usize,
    pub poisoned: usize,
    pub failed: usize,
    /// Tenants whose batch was abandoned on a store or routing error
    pub tenant_errors: usize,
}

/// Drains every active tenant's outbox onto the queue.
pub struct OutboxDispatcher {
    catalog: Arc<dyn TenantCatalog>,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn QueuePublisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        catalog: Arc<dyn TenantCatalog>,
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn QueuePublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            publisher,
            config,
        }
    }

    /// Ticks until `shutdown` fires. A failed tick is logged and retried
    /// after the poll interval.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "Starting outbox dispatcher"
        );

        loop {
            tokio::select! {
                result = self.tick() => match result {
                    Ok(summary) if summary.dispatched + summary.poisoned + summary.failed > 0 => {
                        debug!(?summary, "Outbox dispatch tick complete");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Outbox dispatch tick failed"),
                },
                _ = shutdown.recv() => break,
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Outbox dispatcher stopped");
    }

    /// One pass over all active tenants. Only a catalog failure fails the tick.
    pub async fn tick(&self) -> Result<DispatchSummary> {
        let tenants = self.catalog.active_tenants().await?;
        let mut summary = DispatchSummary {
            tenants: tenants.len(),
            ..DispatchSummary::default()
        };

        for tenant in &tenants {
            if let Err(e) = self.dispatch_tenant(tenant, &mut summary).await {
                summary.tenant_errors += 1;
                error!(
                    tenant_id = %tenant.tenant_id,
                    tenant_key = %tenant.tenant_key,
                    error = %e,
                    "Outbox dispatch failed for tenant"
                );
            }
        }

        Ok(summary)
    }

    async fn dispatch_tenant(&self, tenant: &TenantCatalogEntry, summary: &mut DispatchSummary) -> Result<()> {
        let records = self.store.dequeue_pending(tenant, self.config.batch_size).await?;
        for record in &records {
            self.dispatch_record(tenant, record, summary).await?;
        }
        Ok(())
    }

    async fn dispatch_record(
        &self,
        tenant: &TenantCatalogEntry,
        record: &OutboxRecord,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        let envelope = record.to_envelope();
        // `attempts` already counts this claim
        let previous_attempts = record.attempts.saturating_sub(1);
        let poison = previous_attempts >= self.config.max_attempts;

        let published = if poison {
            warn!(
                tenant_id = %tenant.tenant_id,
                outbox_id = %record.id,
                attempts = previous_attempts,
                queue = %record.queue_name,
                "Outbox message reached max attempts, routing to poison queue"
            );
            self.publisher.publish_poison(&record.queue_name, &envelope).await
        } else {
            self.publisher.publish(&record.queue_name, &envelope).await
        };

        match published {
            Ok(_) => {
                self.store.mark_dispatched(tenant, record.id).await?;
                if poison {
                    summary.poisoned += 1;
                    counter!("tb_outbox_poisoned_total").increment(1);
                } else {
                    summary.dispatched += 1;
                    counter!("tb_outbox_dispatched_total").increment(1);
                }
            }
            Err(e) => {
                let delay = self.config.retry_delay_for(record.attempts);
                warn!(
                    tenant_id = %tenant.tenant_id,
                    outbox_id = %record.id,
                    attempts = record.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to publish outbox message"
                );
                self.store
                    .mark_failed(tenant, record.id, &e.to_string(), delay)
                    .await?;
                summary.failed += 1;
                counter!("tb_outbox_failed_total").increment(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let config = DispatcherConfig::default();
        assert_eq!(config.retry_delay_for(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay_for(7), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = DispatcherConfig {
            backoff: BackoffKind::Exponential,
            retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(60),
            ..DispatcherConfig::default()
        };
        assert_eq!(config.retry_delay_for(1), Duration::from_secs(10));
        assert_eq!(config.retry_delay_for(2), Duration::from_secs(20));
        assert_eq!(config.retry_delay_for(3), Duration::from_secs(40));
        assert_eq!(config.retry_delay_for(4), Duration::from_secs(60));
        assert_eq!(config.retry_delay_for(50), Duration::from_secs(60));
    }
}
