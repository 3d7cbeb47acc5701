use crate::{IdempotencyCompletion, IdempotencyRecord, IdempotencyStart, IdempotencyStore, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tb_common::{DataError, TenantResolution};
use tb_tenancy::TenantConnectionProvider;
use tracing::{debug, error, info};

/// Attempts to re-claim a key whose row vanished between insert and read.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Keys live in `core.idempotency_key` of the tenant's own database.
pub struct PgIdempotencyStore {
    connections: Arc<TenantConnectionProvider>,
}

impl PgIdempotencyStore {
    pub fn new(connections: Arc<TenantConnectionProvider>) -> Self {
        Self { connections }
    }

    /// Creates the key table and its row-level security policy.
    pub async fn init_schema(pool: &PgPool) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE SCHEMA IF NOT EXISTS core;

            CREATE TABLE IF NOT EXISTS core.idempotency_key (
                tenant_id UUID NOT NULL,
                idempotency_key TEXT NOT NULL,
                request_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ,
                response_status INTEGER,
                response_body TEXT,
                response_content_type TEXT,
                PRIMARY KEY (tenant_id, idempotency_key)
            );

            ALTER TABLE core.idempotency_key ENABLE ROW LEVEL SECURITY;
            ALTER TABLE core.idempotency_key FORCE ROW LEVEL SECURITY;
            DROP POLICY IF EXISTS tenant_isolation ON core.idempotency_key;
            CREATE POLICY tenant_isolation ON core.idempotency_key
                USING (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid)
                WITH CHECK (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid);
            "#,
        )
        .execute(pool)
        .await
        .map_err(DataError::during("initialize idempotency schema"))?;

        info!("Idempotency schema initialized");
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_start(
        &self,
        tenant: &TenantResolution,
        key: &str,
        request_hash: &str,
    ) -> Result<IdempotencyStart> {
        let tenant_id = tenant.tenant.id;
        let mut conn = self.connections.open_route(tenant).await?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO core.idempotency_key (tenant_id, idempotency_key, request_hash)
                VALUES ($1, $2, $3)
                ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(key)
            .bind(request_hash)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                error!(tenant_id = %tenant_id, key = %key, error = %e, "Failed to claim idempotency key");
                DataError::translate("claim idempotency key", e)
            })?;

            if inserted.rows_affected() == 1 {
                return Ok(IdempotencyStart::Started);
            }

            let existing = sqlx::query(
                r#"
                SELECT request_hash, completed_at, response_status, response_body, response_content_type
                FROM core.idempotency_key
                WHERE tenant_id = $1 AND idempotency_key = $2
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DataError::during("load idempotency key"))?;

            let Some(row) = existing else {
                debug!(tenant_id = %tenant_id, key = %key, "Idempotency key removed during claim, retrying");
                continue;
            };

            let stored_hash: String = row.get("request_hash");
            if stored_hash != request_hash {
                return Ok(IdempotencyStart::Conflict);
            }

            let completed_at: Option<DateTime<Utc>> = row.get("completed_at");
            let status: Option<i32> = row.get("response_status");
            return Ok(match (completed_at, status) {
                (Some(completed_at), Some(status)) => IdempotencyStart::Completed(IdempotencyRecord {
                    status: u16::try_from(status).unwrap_or(500),
                    body: row.get("response_body"),
                    content_type: row.get("response_content_type"),
                    completed_at,
                }),
                _ => IdempotencyStart::InProgress,
            });
        }

        Ok(IdempotencyStart::InProgress)
    }

    async fn complete(&self, tenant: &TenantResolution, completion: &IdempotencyCompletion) -> Result<()> {
        let mut conn = self.connections.open_route(tenant).await?;
        sqlx::query(
            r#"
            UPDATE core.idempotency_key
            SET completed_at = now(),
                response_status = $3,
                response_body = $4,
                response_content_type = $5
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant.tenant.id.as_uuid())
        .bind(&completion.key)
        .bind(i32::from(completion.status))
        .bind(&completion.body)
        .bind(&completion.content_type)
        .execute(&mut *conn)
        .await
        .map_err(DataError::during("complete idempotency key"))?;
        Ok(())
    }

    async fn remove(&self, tenant: &TenantResolution, key: &str) -> Result<()> {
        let mut conn = self.connections.open_route(tenant).await?;
        sqlx::query("DELETE FROM core.idempotency_key WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(tenant.tenant.id.as_uuid())
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(DataError::during("remove idempotency key"))?;
        Ok(())
    }
}
