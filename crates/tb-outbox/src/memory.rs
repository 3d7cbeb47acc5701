use crate::{truncate_error, validate, OutboxError, OutboxStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tb_common::{OutboxMessage, OutboxRecord, TenantCatalogEntry};
use uuid::Uuid;

/// Process-local outbox for tests and single-node development.
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
    lease: Duration,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn new_record(message: &OutboxMessage, now: DateTime<Utc>) -> OutboxRecord {
    OutboxRecord {
        id: Uuid::new_v4(),
        tenant_id: message.tenant_id,
        queue_name: message.queue_name.clone(),
        message_type: message.message_type.clone(),
        payload: message.payload.clone(),
        correlation_id: message.correlation_id.clone(),
        idempotency_key: message.idempotency_key.clone(),
        occurred_at: now,
        attempts: 0,
        dispatched_at: None,
        available_at: message.available_at.unwrap_or(now),
        last_error: None,
    }
}

impl InMemoryOutboxStore {
    pub fn new(lease: Duration) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            lease,
        }
    }

    /// Writes `message` as an already-committed row.
    pub fn insert(&self, message: &OutboxMessage) -> Result<Uuid> {
        let mut tx = self.begin();
        let id = tx.enqueue(message)?;
        tx.commit();
        Ok(id)
    }

    /// Starts a unit of work whose rows become visible only on `commit`.
    pub fn begin(&self) -> InMemoryOutboxTransaction<'_> {
        InMemoryOutboxTransaction {
            store: self,
            pending: Vec::new(),
        }
    }

    pub fn get(&self, outbox_id: Uuid) -> Option<OutboxRecord> {
        self.records.lock().iter().find(|r| r.id == outbox_id).cloned()
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.lock().clone()
    }

    /// Makes a row due immediately, as if its delay had elapsed.
    pub fn make_due(&self, outbox_id: Uuid) {
        if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == outbox_id) {
            record.available_at = Utc::now();
        }
    }
}

/// Buffered writes; dropping without `commit` discards them.
pub struct InMemoryOutboxTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    pending: Vec<OutboxRecord>,
}

impl InMemoryOutboxTransaction<'_> {
    pub fn enqueue(&mut self, message: &OutboxMessage) -> Result<Uuid> {
        validate(message)?;
        let record = new_record(message, Utc::now());
        let id = record.id;
        self.pending.push(record);
        Ok(id)
    }

    pub fn commit(self) {
        self.store.records.lock().extend(self.pending);
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn dequeue_pending(&self, tenant: &TenantCatalogEntry, batch_size: u32) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let mut records = self.records.lock();

        let mut due: Vec<&mut OutboxRecord> = records
            .iter_mut()
            .filter(|r| r.tenant_id == tenant.tenant_id && r.is_pending() && r.available_at <= now)
            .collect();
        due.sort_by_key(|r| r.occurred_at);

        Ok(due
            .into_iter()
            .take(batch_size as usize)
            .map(|record| {
                record.attempts += 1;
                record.available_at = after(now, self.lease);
                record.clone()
            })
            .collect())
    }

    async fn mark_dispatched(&self, tenant: &TenantCatalogEntry, outbox_id: Uuid) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == outbox_id && r.tenant_id == tenant.tenant_id)
            .ok_or_else(|| OutboxError::Validation(format!("unknown outbox message {}", outbox_id)))?;
        record.dispatched_at = Some(Utc::now());
        record.last_error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        tenant: &TenantCatalogEntry,
        outbox_id: Uuid,
        error: &str,
        retry_delay: Duration,
    ) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == outbox_id && r.tenant_id == tenant.tenant_id)
            .ok_or_else(|| OutboxError::Validation(format!("unknown outbox message {}", outbox_id)))?;
        record.last_error = Some(truncate_error(error).to_string());
        record.available_at = after(Utc::now(), retry_delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_common::{TenantId, TenantTier};

    fn entry(tenant_id: TenantId) -> TenantCatalogEntry {
        TenantCatalogEntry {
            tenant_id,
            tenant_key: "acme".to_string(),
            tier: TenantTier::Shared,
            database: None,
        }
    }

    #[tokio::test]
    async fn test_rolled_back_rows_never_appear() {
        let store = InMemoryOutboxStore::default();
        let tenant = TenantId::new();

        {
            let mut tx = store.begin();
            tx.enqueue(&OutboxMessage::new(tenant, "orders", "order.created", "{}"))
                .unwrap();
        }

        let mut tx = store.begin();
        let kept = tx
            .enqueue(&OutboxMessage::new(tenant, "orders", "order.paid", "{}"))
            .unwrap();
        tx.commit();

        let claimed = store.dequeue_pending(&entry(tenant), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, kept);
    }

    #[tokio::test]
    async fn test_delayed_rows_wait_for_available_at() {
        let store = InMemoryOutboxStore::default();
        let tenant = TenantId::new();
        let id = store
            .insert(
                &OutboxMessage::new(tenant, "orders", "reminder", "{}")
                    .available_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .unwrap();

        assert!(store.dequeue_pending(&entry(tenant), 10).await.unwrap().is_empty());

        store.make_due(id);
        assert_eq!(store.dequeue_pending(&entry(tenant), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_and_oldest_first() {
        let store = InMemoryOutboxStore::default();
        let tenant = TenantId::new();
        let first = store.insert(&OutboxMessage::new(tenant, "q", "a", "1")).unwrap();
        let second = store.insert(&OutboxMessage::new(tenant, "q", "b", "2")).unwrap();
        store.insert(&OutboxMessage::new(TenantId::new(), "q", "other", "3")).unwrap();

        let batch = store.dequeue_pending(&entry(tenant), 1).await.unwrap();
        assert_eq!(batch[0].id, first);
        assert_eq!(batch[0].attempts, 1);

        let batch = store.dequeue_pending(&entry(tenant), 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, second);

        assert!(store.dequeue_pending(&entry(tenant), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_records_error_and_delays() {
        let store = InMemoryOutboxStore::new(Duration::ZERO);
        let tenant = TenantId::new();
        let id = store.insert(&OutboxMessage::new(tenant, "q", "a", "{}")).unwrap();

        store.dequeue_pending(&entry(tenant), 10).await.unwrap();
        store
            .mark_failed(&entry(tenant), id, "broker down", Duration::from_secs(60))
            .await
            .unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.last_error.as_deref(), Some("broker down"));
        assert!(record.available_at > Utc::now());
        assert!(record.is_pending());
        assert!(store.dequeue_pending(&entry(tenant), 10).await.unwrap().is_empty());
    }
}
