use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod logging;

pub use error::{DataError, DataErrorKind};

/// Envelope schema version produced by this build. Consumers poison anything newer.
pub const ENVELOPE_SCHEMA_VERSION: i32 = 1;

// ============================================================================
// Tenant Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Storage placement of a tenant's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantTier {
    /// Rows live in the shared tenant database, separated by `tenant_id`
    Shared,
    /// Tenant owns a dedicated database
    Isolated,
}

impl TenantTier {
    /// Maps the catalog's numeric tier id. Unknown ids yield `None`.
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Self::Shared),
            2 => Some(Self::Isolated),
            _ => None,
        }
    }

    pub fn id(&self) -> i16 {
        match self {
            Self::Shared => 1,
            Self::Isolated => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    pub id: TenantId,
    pub key: String,
    pub tier: TenantTier,
}

/// Dedicated database of an isolated tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDatabase {
    pub database_name: String,
    /// Host override; `None` means the configured tenant server
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    Cache,
    Catalog,
}

/// Result of mapping a request host to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResolution {
    pub tenant: TenantInfo,
    pub database: Option<TenantDatabase>,
    pub source: ResolutionSource,
}

/// Active tenant as enumerated by the catalog for background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantCatalogEntry {
    pub tenant_id: TenantId,
    pub tenant_key: String,
    pub tier: TenantTier,
    pub database: Option<TenantDatabase>,
}

/// Anything that carries enough information to pick a tenant database.
pub trait TenantRoute: Send + Sync {
    fn tenant_id(&self) -> TenantId;
    fn tier(&self) -> TenantTier;
    fn database(&self) -> Option<&TenantDatabase>;
}

impl TenantRoute for TenantResolution {
    fn tenant_id(&self) -> TenantId {
        self.tenant.id
    }

    fn tier(&self) -> TenantTier {
        self.tenant.tier
    }

    fn database(&self) -> Option<&TenantDatabase> {
        self.database.as_ref()
    }
}

impl TenantRoute for TenantCatalogEntry {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn tier(&self) -> TenantTier {
        self.tier
    }

    fn database(&self) -> Option<&TenantDatabase> {
        self.database.as_ref()
    }
}

// ============================================================================
// Outbox Types
// ============================================================================

/// A message to be written to the outbox inside a business transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub tenant_id: TenantId,
    pub queue_name: String,
    pub message_type: String,
    /// JSON document, stored verbatim
    pub payload: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Earliest dispatch time; `None` means immediately
    pub available_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        tenant_id: TenantId,
        queue_name: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            queue_name: queue_name.into(),
            message_type: message_type.into(),
            payload: payload.into(),
            correlation_id: None,
            idempotency_key: None,
            available_at: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub queue_name: String,
    pub message_type: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// Dispatch attempts so far, counted when the row is claimed
    pub attempts: i32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn is_pending(&self) -> bool {
        self.dispatched_at.is_none()
    }

    pub fn to_envelope(&self) -> QueueEnvelope {
        QueueEnvelope::from(self)
    }
}

// ============================================================================
// Queue Envelope
// ============================================================================

fn default_schema_version() -> i32 {
    ENVELOPE_SCHEMA_VERSION
}

/// Wire format of a queue message, serialized as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEnvelope {
    pub outbox_id: Uuid,
    pub tenant_id: TenantId,
    pub message_type: String,
    pub payload: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i32,
}

impl From<&OutboxRecord> for QueueEnvelope {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            outbox_id: record.id,
            tenant_id: record.tenant_id,
            message_type: record.message_type.clone(),
            payload: record.payload.clone(),
            correlation_id: record.correlation_id.clone(),
            idempotency_key: record.idempotency_key.clone(),
            occurred_at: record.occurred_at,
            schema_version: ENVELOPE_SCHEMA_VERSION,
        }
    }
}

impl QueueEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}
