//! Tenantbus configuration.
//!
//! Configuration is layered:
//! - built-in defaults (`AppConfig::default()`)
//! - an optional TOML file, path taken from `TB_CONFIG`
//! - `TB_*` environment variable overrides
//!
//! Delays expressed in seconds or minutes are floored at 1.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub catalog_db: String,
    pub tenant_shared_db: String,
    pub application_name: String,
    /// Pool size per physical tenant database
    pub max_connections: u32,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            catalog_db: "catalog".to_string(),
            tenant_shared_db: "tenant_shared".to_string(),
            application_name: "tenantbus".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Empty disables the tenant cache
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancySettings {
    pub cache_ttl_minutes: u64,
    pub admin_host_prefix: String,
    pub bypass_hosts: Vec<String>,
}

impl Default for TenancySettings {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: 5,
            admin_host_prefix: "admin".to_string(),
            bypass_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

impl TenancySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes.max(1) * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub enabled: bool,
    pub max_body_bytes: usize,
    pub max_response_bytes: usize,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_bytes: 256 * 1024,
            max_response_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Sqlite,
    Sqs,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "sqs" => Ok(Self::Sqs),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    /// Prepended as `<prefix>-` to every queue name
    pub prefix: String,
    /// SQLite database path or SQS endpoint override
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub batch_size: u32,
    pub poll_delay_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub backoff: BackoffKind,
    pub max_attempts: i32,
    pub lease_seconds: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_delay_seconds: 2,
            retry_delay_seconds: 10,
            max_retry_delay_seconds: 300,
            backoff: BackoffKind::Fixed,
            max_attempts: 10,
            lease_seconds: 30,
        }
    }
}

impl DispatcherSettings {
    pub fn poll_delay(&self) -> Duration {
        secs_at_least_one(self.poll_delay_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        secs_at_least_one(self.retry_delay_seconds)
    }

    pub fn max_retry_delay(&self) -> Duration {
        secs_at_least_one(self.max_retry_delay_seconds.max(self.retry_delay_seconds))
    }

    pub fn lease(&self) -> Duration {
        secs_at_least_one(self.lease_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub queues: Vec<String>,
    pub batch_size: u32,
    pub poll_delay_seconds: u64,
    pub visibility_timeout_seconds: u64,
    pub max_dequeue_count: u32,
    pub poison_message_ttl_days: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            batch_size: 16,
            poll_delay_seconds: 2,
            visibility_timeout_seconds: 30,
            max_dequeue_count: 5,
            poison_message_ttl_days: 7,
        }
    }
}

impl ProcessorSettings {
    /// Receive batch size clamped to what queue backends accept.
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.clamp(1, 32)
    }

    pub fn poll_delay(&self) -> Duration {
        secs_at_least_one(self.poll_delay_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        secs_at_least_one(self.visibility_timeout_seconds)
    }

    pub fn poison_message_ttl(&self) -> Duration {
        Duration::from_secs(self.poison_message_ttl_days.clamp(1, 7) * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub api_port: u16,
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_port: 8080,
            metrics_port: 9090,
        }
    }
}

fn secs_at_least_one(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub postgres: PostgresSettings,
    pub redis: RedisSettings,
    pub tenancy: TenancySettings,
    pub idempotency: IdempotencySettings,
    pub queues: QueueSettings,
    pub outbox_dispatcher: DispatcherSettings,
    pub queue_processor: ProcessorSettings,
    pub server: ServerSettings,
}

impl AppConfig {
    /// Loads defaults, the file named by `TB_CONFIG` if set, then `TB_*` overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("TB_CONFIG").ok().filter(|p| !p.trim().is_empty());
        Self::load_from(path.as_deref().map(Path::new), |key| std::env::var(key).ok())
    }

    pub fn load_from<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `TB_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup: &lookup };

        env.string("TB_POSTGRES_HOST", &mut self.postgres.host);
        env.parse("TB_POSTGRES_PORT", &mut self.postgres.port)?;
        env.string("TB_POSTGRES_USERNAME", &mut self.postgres.username);
        env.string("TB_POSTGRES_PASSWORD", &mut self.postgres.password);
        env.string("TB_POSTGRES_CATALOG_DB", &mut self.postgres.catalog_db);
        env.string("TB_POSTGRES_TENANT_SHARED_DB", &mut self.postgres.tenant_shared_db);
        env.string("TB_POSTGRES_APPLICATION_NAME", &mut self.postgres.application_name);
        env.parse("TB_POSTGRES_MAX_CONNECTIONS", &mut self.postgres.max_connections)?;

        env.string("TB_REDIS_URL", &mut self.redis.url);

        env.parse("TB_TENANCY_CACHE_TTL_MINUTES", &mut self.tenancy.cache_ttl_minutes)?;
        env.string("TB_TENANCY_ADMIN_HOST_PREFIX", &mut self.tenancy.admin_host_prefix);
        env.list("TB_TENANCY_BYPASS_HOSTS", &mut self.tenancy.bypass_hosts);

        env.parse("TB_IDEMPOTENCY_ENABLED", &mut self.idempotency.enabled)?;
        env.parse("TB_IDEMPOTENCY_MAX_BODY_BYTES", &mut self.idempotency.max_body_bytes)?;
        env.parse("TB_IDEMPOTENCY_MAX_RESPONSE_BYTES", &mut self.idempotency.max_response_bytes)?;

        env.parse("TB_QUEUE_BACKEND", &mut self.queues.backend)?;
        env.string("TB_QUEUE_PREFIX", &mut self.queues.prefix);
        env.string("TB_QUEUE_URL", &mut self.queues.url);

        let dispatcher = &mut self.outbox_dispatcher;
        env.parse("TB_OUTBOX_BATCH_SIZE", &mut dispatcher.batch_size)?;
        env.parse("TB_OUTBOX_POLL_DELAY_SECONDS", &mut dispatcher.poll_delay_seconds)?;
        env.parse("TB_OUTBOX_RETRY_DELAY_SECONDS", &mut dispatcher.retry_delay_seconds)?;
        env.parse("TB_OUTBOX_MAX_RETRY_DELAY_SECONDS", &mut dispatcher.max_retry_delay_seconds)?;
        env.parse("TB_OUTBOX_BACKOFF", &mut dispatcher.backoff)?;
        env.parse("TB_OUTBOX_MAX_ATTEMPTS", &mut dispatcher.max_attempts)?;
        env.parse("TB_OUTBOX_LEASE_SECONDS", &mut dispatcher.lease_seconds)?;

        let processor = &mut self.queue_processor;
        env.list("TB_PROCESSOR_QUEUES", &mut processor.queues);
        env.parse("TB_PROCESSOR_BATCH_SIZE", &mut processor.batch_size)?;
        env.parse("TB_PROCESSOR_POLL_DELAY_SECONDS", &mut processor.poll_delay_seconds)?;
        env.parse("TB_PROCESSOR_VISIBILITY_TIMEOUT_SECONDS", &mut processor.visibility_timeout_seconds)?;
        env.parse("TB_PROCESSOR_MAX_DEQUEUE_COUNT", &mut processor.max_dequeue_count)?;
        env.parse("TB_PROCESSOR_POISON_MESSAGE_TTL_DAYS", &mut processor.poison_message_ttl_days)?;

        env.parse("TB_API_PORT", &mut self.server.api_port)?;
        env.parse("TB_METRICS_PORT", &mut self.server.metrics_port)?;

        Ok(())
    }
}

struct Overrides<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn list(&self, key: &str, target: &mut Vec<String>) {
        if let Some(value) = self.get(key) {
            *target = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        let Some(value) = self.get(key) else {
            return Ok(());
        };
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.idempotency.max_body_bytes, 262_144);
        assert_eq!(config.outbox_dispatcher.batch_size, 25);
        assert_eq!(config.outbox_dispatcher.max_attempts, 10);
        assert_eq!(config.outbox_dispatcher.retry_delay(), Duration::from_secs(10));
        assert_eq!(config.queue_processor.max_dequeue_count, 5);
        assert_eq!(config.queue_processor.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.tenancy.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.tenancy.bypass_hosts, vec!["localhost", "127.0.0.1"]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [outbox_dispatcher]
            batch_size = 5
            backoff = "exponential"

            [queue_processor]
            queues = ["orders", "billing"]
            "#,
        )
        .unwrap();

        assert_eq!(config.outbox_dispatcher.batch_size, 5);
        assert_eq!(config.outbox_dispatcher.backoff, BackoffKind::Exponential);
        assert_eq!(config.outbox_dispatcher.max_attempts, 10);
        assert_eq!(config.queue_processor.queues, vec!["orders", "billing"]);
        assert_eq!(config.postgres.port, 5432);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queues]\nbackend = \"sqlite\"\nprefix = \"dev\"").unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("TB_QUEUE_PREFIX", "prod"),
            ("TB_PROCESSOR_QUEUES", " orders , ,billing"),
            ("TB_IDEMPOTENCY_ENABLED", "false"),
        ]);
        let config =
            AppConfig::load_from(Some(file.path()), |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.queues.backend, QueueBackend::Sqlite);
        assert_eq!(config.queues.prefix, "prod");
        assert_eq!(config.queue_processor.queues, vec!["orders", "billing"]);
        assert!(!config.idempotency.enabled);
    }

    #[test]
    fn test_invalid_override_is_reported() {
        let err = AppConfig::load_from(None, |k| {
            (k == "TB_OUTBOX_MAX_ATTEMPTS").then(|| "lots".to_string())
        })
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TB_OUTBOX_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_clamps_and_floors() {
        let mut config = AppConfig::load_from(None, no_env).unwrap();
        config.queue_processor.batch_size = 100;
        config.queue_processor.poison_message_ttl_days = 30;
        config.tenancy.cache_ttl_minutes = 0;
        config.outbox_dispatcher.poll_delay_seconds = 0;

        assert_eq!(config.queue_processor.effective_batch_size(), 32);
        assert_eq!(config.queue_processor.poison_message_ttl(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.tenancy.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.outbox_dispatcher.poll_delay(), Duration::from_secs(1));

        config.queue_processor.batch_size = 0;
        assert_eq!(config.queue_processor.effective_batch_size(), 1);
    }
}
