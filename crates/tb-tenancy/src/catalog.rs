use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicUsize, Ordering};
use tb_common::{
    DataError, ResolutionSource, TenantCatalogEntry, TenantDatabase, TenantId, TenantInfo,
    TenantResolution, TenantTier,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry of tenants, their tier and database routing.
#[async_trait]
pub trait TenantCatalog: Send + Sync {
    /// Looks up an active tenant by normalized host.
    ///
    /// Returns `Ok(None)` for unknown hosts, unknown tiers and isolated
    /// tenants without an active database mapping.
    async fn resolve_host(&self, host: &str) -> Result<Option<TenantResolution>>;

    /// Lists active tenants for background work.
    async fn active_tenants(&self) -> Result<Vec<TenantCatalogEntry>>;
}

/// Applies the isolated-tenant routing rule to a catalog hit.
fn catalog_resolution(
    tenant: TenantInfo,
    database: Option<TenantDatabase>,
) -> Option<TenantResolution> {
    let database = match tenant.tier {
        TenantTier::Shared => None,
        TenantTier::Isolated => match database {
            Some(database) => Some(database),
            None => {
                warn!(tenant_id = %tenant.id, "Isolated tenant has no active database mapping");
                return None;
            }
        },
    };

    Some(TenantResolution {
        tenant,
        database,
        source: ResolutionSource::Catalog,
    })
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgTenantCatalog {
    pool: PgPool,
}

impl PgTenantCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the catalog schema and the host lookup function.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE SCHEMA IF NOT EXISTS catalog;

            CREATE TABLE IF NOT EXISTS catalog.tenant_status (
                tenant_status_id SMALLINT PRIMARY KEY,
                status_key TEXT NOT NULL UNIQUE
            );
            INSERT INTO catalog.tenant_status VALUES (1, 'active'), (2, 'suspended')
                ON CONFLICT DO NOTHING;

            CREATE TABLE IF NOT EXISTS catalog.tenant_tier (
                tenant_tier_id SMALLINT PRIMARY KEY,
                tier_key TEXT NOT NULL UNIQUE
            );
            INSERT INTO catalog.tenant_tier VALUES (1, 'shared'), (2, 'isolated')
                ON CONFLICT DO NOTHING;

            CREATE TABLE IF NOT EXISTS catalog.tenant (
                tenant_id UUID PRIMARY KEY,
                tenant_key TEXT NOT NULL UNIQUE,
                tenant_tier_id SMALLINT NOT NULL REFERENCES catalog.tenant_tier,
                tenant_status_id SMALLINT NOT NULL REFERENCES catalog.tenant_status,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS catalog.tenant_host (
                host_name TEXT PRIMARY KEY,
                tenant_id UUID NOT NULL REFERENCES catalog.tenant
            );

            CREATE TABLE IF NOT EXISTS catalog.tenant_database_status (
                tenant_database_status_id SMALLINT PRIMARY KEY,
                status_key TEXT NOT NULL UNIQUE
            );
            INSERT INTO catalog.tenant_database_status VALUES (1, 'active'), (2, 'provisioning'), (3, 'retired')
                ON CONFLICT DO NOTHING;

            CREATE TABLE IF NOT EXISTS catalog.tenant_database (
                tenant_id UUID NOT NULL REFERENCES catalog.tenant,
                database_name TEXT NOT NULL,
                server_name TEXT,
                tenant_database_status_id SMALLINT NOT NULL REFERENCES catalog.tenant_database_status,
                PRIMARY KEY (tenant_id, database_name)
            );

            CREATE OR REPLACE FUNCTION catalog.resolve_tenant_by_host(p_host TEXT)
            RETURNS TABLE (tenant_id UUID, tenant_key TEXT, tenant_tier_id SMALLINT)
            LANGUAGE sql STABLE AS $$
                SELECT t.tenant_id, t.tenant_key, t.tenant_tier_id
                FROM catalog.tenant_host h
                JOIN catalog.tenant t ON t.tenant_id = h.tenant_id
                JOIN catalog.tenant_status s ON s.tenant_status_id = t.tenant_status_id
                WHERE h.host_name = lower(p_host)
                  AND s.status_key = 'active'
            $$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DataError::during("initialize catalog schema"))?;

        info!("Tenant catalog schema initialized");
        Ok(())
    }

    async fn active_database(&self, tenant_id: TenantId) -> Result<Option<TenantDatabase>> {
        let row = sqlx::query(
            r#"
            SELECT d.database_name, d.server_name
            FROM catalog.tenant_database d
            JOIN catalog.tenant_database_status s
              ON s.tenant_database_status_id = d.tenant_database_status_id
            WHERE d.tenant_id = $1
              AND s.status_key = 'active'
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(DataError::during("load tenant database"))?;

        Ok(row.map(|row| TenantDatabase {
            database_name: row.get("database_name"),
            server_name: row.get("server_name"),
        }))
    }
}

#[async_trait]
impl TenantCatalog for PgTenantCatalog {
    async fn resolve_host(&self, host: &str) -> Result<Option<TenantResolution>> {
        let row = sqlx::query(
            "SELECT tenant_id, tenant_key, tenant_tier_id FROM catalog.resolve_tenant_by_host($1)",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await
        .map_err(DataError::during("resolve tenant by host"))?;

        let Some(row) = row else {
            debug!(host = %host, "No tenant registered for host");
            return Ok(None);
        };

        let tier_id: i16 = row.get("tenant_tier_id");
        let Some(tier) = TenantTier::from_id(tier_id) else {
            warn!(tier_id, host = %host, "Unknown tenant tier");
            return Ok(None);
        };

        let tenant = TenantInfo {
            id: TenantId(row.get::<Uuid, _>("tenant_id")),
            key: row.get("tenant_key"),
            tier,
        };

        let database = match tier {
            TenantTier::Isolated => self.active_database(tenant.id).await?,
            TenantTier::Shared => None,
        };

        Ok(catalog_resolution(tenant, database))
    }

    async fn active_tenants(&self) -> Result<Vec<TenantCatalogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT t.tenant_id, t.tenant_key, t.tenant_tier_id, d.database_name, d.server_name
            FROM catalog.tenant t
            JOIN catalog.tenant_status s
              ON s.tenant_status_id = t.tenant_status_id
             AND s.status_key = 'active'
            LEFT JOIN (
                catalog.tenant_database d
                JOIN catalog.tenant_database_status ds
                  ON ds.tenant_database_status_id = d.tenant_database_status_id
                 AND ds.status_key = 'active'
            ) ON d.tenant_id = t.tenant_id
            ORDER BY t.tenant_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DataError::during("load active tenants"))?;

        let mut tenants = Vec::with_capacity(rows.len());
        for row in rows {
            let tenant_id = TenantId(row.get::<Uuid, _>("tenant_id"));
            let tier_id: i16 = row.get("tenant_tier_id");
            let Some(tier) = TenantTier::from_id(tier_id) else {
                warn!(tier_id, tenant_id = %tenant_id, "Unknown tenant tier");
                continue;
            };

            let database = row
                .get::<Option<String>, _>("database_name")
                .map(|database_name| TenantDatabase {
                    database_name,
                    server_name: row.get("server_name"),
                });

            if tier == TenantTier::Isolated && database.is_none() {
                warn!(tenant_id = %tenant_id, "Skipping isolated tenant without active database");
                continue;
            }

            tenants.push(TenantCatalogEntry {
                tenant_id,
                tenant_key: row.get("tenant_key"),
                tier,
                database,
            });
        }

        Ok(tenants)
    }
}

// ============================================================================
// Static (in-process)
// ============================================================================

struct StaticTenant {
    info: TenantInfo,
    hosts: Vec<String>,
    database: Option<TenantDatabase>,
}

/// Fixed tenant registry for local runs and tests.
#[derive(Default)]
pub struct StaticTenantCatalog {
    tenants: RwLock<Vec<StaticTenant>>,
    lookups: AtomicUsize,
}

impl StaticTenantCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(
        &self,
        info: TenantInfo,
        hosts: &[&str],
        database: Option<TenantDatabase>,
    ) -> &Self {
        self.tenants.write().push(StaticTenant {
            info,
            hosts: hosts.iter().map(|h| h.trim().to_lowercase()).collect(),
            database,
        });
        self
    }

    /// Number of `resolve_host` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantCatalog for StaticTenantCatalog {
    async fn resolve_host(&self, host: &str) -> Result<Option<TenantResolution>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let tenants = self.tenants.read();
        let Some(tenant) = tenants.iter().find(|t| t.hosts.iter().any(|h| h == host)) else {
            return Ok(None);
        };

        Ok(catalog_resolution(tenant.info.clone(), tenant.database.clone()))
    }

    async fn active_tenants(&self) -> Result<Vec<TenantCatalogEntry>> {
        let tenants = self.tenants.read();
        Ok(tenants
            .iter()
            .filter(|t| t.info.tier == TenantTier::Shared || t.database.is_some())
            .map(|t| TenantCatalogEntry {
                tenant_id: t.info.id,
                tenant_key: t.info.key.clone(),
                tier: t.info.tier,
                database: t.database.clone(),
            })
            .collect())
    }
}
