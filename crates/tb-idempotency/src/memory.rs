use crate::{IdempotencyCompletion, IdempotencyRecord, IdempotencyStart, IdempotencyStore, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tb_common::{TenantId, TenantResolution};

struct KeyState {
    request_hash: String,
    record: Option<IdempotencyRecord>,
}

/// Process-local store. The mutex stands in for the table's unique key.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<(TenantId, String), KeyState>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    pub fn contains(&self, tenant_id: TenantId, key: &str) -> bool {
        self.keys.lock().contains_key(&(tenant_id, key.to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_start(
        &self,
        tenant: &TenantResolution,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyStart> {
        let mut keys = self.keys.lock();
        match keys.entry((tenant.tenant.id, key.to_string())) {
            Entry::Vacant(slot) => {
                slot.insert(KeyState {
                    request_hash: request_hash.to_string(),
                    record: None,
                });
                Ok(IdempotencyStart::Started)
            }
            Entry::Occupied(existing) => {
                let state = existing.get();
                if state.request_hash != request_hash {
                    return Ok(IdempotencyStart::Conflict);
                }
                Ok(match &state.record {
                    Some(record) => IdempotencyStart::Completed(record.clone()),
                    None => IdempotencyStart::InProgress,
                })
            }
        }
    }

    async fn complete(&self, tenant: &TenantResolution, completion: &IdempotencyCompletion) -> Result<()> {
        if let Some(state) = self
            .keys
            .lock()
            .get_mut(&(tenant.tenant.id, completion.key.clone()))
        {
            state.record = Some(IdempotencyRecord {
                status: completion.status,
                body: Some(completion.body.clone()),
                content_type: completion.content_type.clone(),
                completed_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn remove(&self, tenant: &TenantResolution, key: &str) -> Result<()> {
        self.keys.lock().remove(&(tenant.tenant.id, key.to_string()));
        Ok(())
    }
}
