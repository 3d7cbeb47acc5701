use crate::{truncate_error, OutboxStore, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tb_common::{DataError, OutboxRecord, TenantCatalogEntry, TenantId};
use tb_tenancy::TenantConnectionProvider;
use tracing::{debug, info};
use uuid::Uuid;

/// Outbox rows in `core.outbox_message` of each tenant's database.
pub struct PgOutboxStore {
    connections: Arc<TenantConnectionProvider>,
    lease: Duration,
}

impl PgOutboxStore {
    /// `lease` hides claimed rows from other dispatchers until they are
    /// marked, so a crash between claim and publish only delays the row.
    pub fn new(connections: Arc<TenantConnectionProvider>, lease: Duration) -> Self {
        Self { connections, lease }
    }

    pub async fn init_schema(pool: &PgPool) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE SCHEMA IF NOT EXISTS core;

            CREATE TABLE IF NOT EXISTS core.outbox_message (
                outbox_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                tenant_id UUID NOT NULL,
                queue_name TEXT NOT NULL CHECK (queue_name <> ''),
                message_type TEXT NOT NULL CHECK (message_type <> ''),
                payload JSONB NOT NULL,
                correlation_id TEXT,
                idempotency_key TEXT,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                dispatched_at TIMESTAMPTZ,
                available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS ix_outbox_message_pending
                ON core.outbox_message (tenant_id, available_at, occurred_at)
                WHERE dispatched_at IS NULL;

            ALTER TABLE core.outbox_message ENABLE ROW LEVEL SECURITY;
            ALTER TABLE core.outbox_message FORCE ROW LEVEL SECURITY;
            DROP POLICY IF EXISTS tenant_isolation ON core.outbox_message;
            CREATE POLICY tenant_isolation ON core.outbox_message
                USING (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid)
                WITH CHECK (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid);
            "#,
        )
        .execute(pool)
        .await
        .map_err(DataError::during("initialize outbox schema"))?;

        info!("Outbox schema initialized");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> OutboxRecord {
    OutboxRecord {
        id: row.get("outbox_id"),
        tenant_id: TenantId(row.get::<Uuid, _>("tenant_id")),
        queue_name: row.get("queue_name"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        correlation_id: row.get("correlation_id"),
        idempotency_key: row.get("idempotency_key"),
        occurred_at: row.get("occurred_at"),
        attempts: row.get("attempts"),
        dispatched_at: row.get("dispatched_at"),
        available_at: row.get("available_at"),
        last_error: row.get("last_error"),
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn dequeue_pending(&self, tenant: &TenantCatalogEntry, batch_size: u32) -> Result<Vec<OutboxRecord>> {
        let mut conn = self.connections.open_route(tenant).await?;
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .map_err(DataError::during("begin outbox claim"))?;

        let rows = sqlx::query(
            r#"
            SELECT outbox_id, tenant_id, queue_name, message_type, payload::text AS payload,
                   correlation_id, idempotency_key, occurred_at, attempts,
                   dispatched_at, available_at, last_error
            FROM core.outbox_message
            WHERE tenant_id = $1
              AND dispatched_at IS NULL
              AND available_at <= now()
            ORDER BY occurred_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(tenant.tenant_id.as_uuid())
        .bind(i64::from(batch_size))
        .fetch_all(&mut *tx)
        .await
        .map_err(DataError::during("select pending outbox messages"))?;

        if rows.is_empty() {
            tx.commit().await.map_err(DataError::during("commit outbox claim"))?;
            return Ok(Vec::new());
        }

        let mut records: Vec<OutboxRecord> = rows.iter().map(record_from_row).collect();
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

        let claimed = sqlx::query(
            r#"
            UPDATE core.outbox_message
            SET attempts = attempts + 1,
                available_at = now() + make_interval(secs => $2)
            WHERE outbox_id = ANY($1)
            RETURNING outbox_id, attempts, available_at
            "#,
        )
        .bind(&ids)
        .bind(self.lease.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(DataError::during("increment outbox attempts"))?;

        tx.commit().await.map_err(DataError::during("commit outbox claim"))?;

        for row in claimed {
            let id: Uuid = row.get("outbox_id");
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.attempts = row.get("attempts");
                record.available_at = row.get("available_at");
            }
        }

        debug!(tenant_id = %tenant.tenant_id, count = records.len(), "Claimed outbox messages");
        Ok(records)
    }

    async fn mark_dispatched(&self, tenant: &TenantCatalogEntry, outbox_id: Uuid) -> Result<()> {
        let mut conn = self.connections.open_route(tenant).await?;
        sqlx::query(
            "UPDATE core.outbox_message SET dispatched_at = now(), last_error = NULL WHERE outbox_id = $1",
        )
        .bind(outbox_id)
        .execute(&mut *conn)
        .await
        .map_err(DataError::during("mark outbox message dispatched"))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        tenant: &TenantCatalogEntry,
        outbox_id: Uuid,
        error: &str,
        retry_delay: Duration,
    ) -> Result<()> {
        let mut conn = self.connections.open_route(tenant).await?;
        sqlx::query(
            r#"
            UPDATE core.outbox_message
            SET last_error = $2,
                available_at = now() + make_interval(secs => $3)
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id)
        .bind(truncate_error(error))
        .bind(retry_delay.as_secs_f64())
        .execute(&mut *conn)
        .await
        .map_err(DataError::during("mark outbox message failed"))?;
        Ok(())
    }
}
