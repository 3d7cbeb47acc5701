use crate::{Result, TenancyError};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tb_common::TenantResolution;
use tokio::time::Instant;
use tracing::info;

/// Host-keyed cache of tenant resolutions.
///
/// Errors are reported to the caller, which treats them as a miss.
#[async_trait]
pub trait TenantCache: Send + Sync {
    async fn get(&self, host: &str) -> Result<Option<TenantResolution>>;
    async fn set(&self, host: &str, resolution: &TenantResolution, ttl: Duration) -> Result<()>;
}

/// Cache that never stores anything. Used when Redis is not configured.
pub struct NullTenantCache;

#[async_trait]
impl TenantCache for NullTenantCache {
    async fn get(&self, _host: &str) -> Result<Option<TenantResolution>> {
        Ok(None)
    }

    async fn set(&self, _host: &str, _resolution: &TenantResolution, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct InMemoryTenantCache {
    entries: DashMap<String, (TenantResolution, Instant)>,
}

impl InMemoryTenantCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TenantCache for InMemoryTenantCache {
    async fn get(&self, host: &str) -> Result<Option<TenantResolution>> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(host)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());

        if hit.is_none() {
            self.entries.remove_if(host, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(hit)
    }

    async fn set(&self, host: &str, resolution: &TenantResolution, ttl: Duration) -> Result<()> {
        self.entries
            .insert(host.to_string(), (resolution.clone(), Instant::now() + ttl));
        Ok(())
    }
}

// ============================================================================
// Redis
// ============================================================================

pub struct RedisTenantCache {
    connection: ConnectionManager,
}

impl RedisTenantCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_error)?;
        let connection = ConnectionManager::new(client).await.map_err(cache_error)?;
        info!("Connected tenant cache to Redis");
        Ok(Self { connection })
    }

    pub fn key(host: &str) -> String {
        format!("tenancy:host:{}", host)
    }
}

fn cache_error(err: impl std::fmt::Display) -> TenancyError {
    TenancyError::Cache(err.to_string())
}

#[async_trait]
impl TenantCache for RedisTenantCache {
    async fn get(&self, host: &str) -> Result<Option<TenantResolution>> {
        let mut connection = self.connection.clone();
        let payload: Option<String> = connection.get(Self::key(host)).await.map_err(cache_error)?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload).map_err(cache_error)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, host: &str, resolution: &TenantResolution, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(resolution).map_err(cache_error)?;
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(Self::key(host), payload, ttl.as_secs().max(1))
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}
