use crate::correlation::CorrelationId;
use crate::error::ApiError;
use crate::idempotency::IdempotencyKey;
use crate::tenant::CurrentTenant;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tb_common::{DataError, OutboxMessage, ResolutionSource, TenantId, TenantTier};
use tb_tenancy::TenantContext;
use tracing::info;
use uuid::Uuid;

pub const NOTES_QUEUE: &str = "notes";
pub const NOTE_CREATED: &str = "note.created";

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
    })
}

// ============================================================================
// Tenancy ping
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenancyPingResponse {
    pub tenant_id: TenantId,
    pub tenant_key: String,
    pub tier: TenantTier,
    pub source: ResolutionSource,
    pub database: String,
    pub server_version: String,
    /// Session tenant as seen by row-level security
    pub app_tenant_id: Option<String>,
}

/// Reports where the current tenant's connection is routed.
pub async fn tenancy_ping(
    State(state): State<AppState>,
    Extension(context): Extension<TenantContext>,
) -> Result<Json<TenancyPingResponse>, ApiError> {
    let resolution = context.require()?;
    let mut conn = state.connections.open(&context).await?;

    let row = sqlx::query(
        r#"
        SELECT current_database() AS database,
               current_setting('server_version') AS server_version,
               current_setting('app.tenant_id', true) AS app_tenant_id
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(DataError::during("tenancy ping"))?;

    Ok(Json(TenancyPingResponse {
        tenant_id: resolution.tenant.id,
        tenant_key: resolution.tenant.key.clone(),
        tier: resolution.tenant.tier,
        source: resolution.source,
        database: row.get("database"),
        server_version: row.get("server_version"),
        app_tenant_id: row.get("app_tenant_id"),
    }))
}

// ============================================================================
// Notes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteResponse {
    pub note_id: Uuid,
    pub outbox_id: Uuid,
}

/// Creates `core.note` with row-level security on `app.tenant_id`.
pub async fn init_note_schema(pool: &PgPool) -> Result<(), DataError> {
    sqlx::raw_sql(
        r#"
        CREATE SCHEMA IF NOT EXISTS core;

        CREATE TABLE IF NOT EXISTS core.note (
            note_id UUID PRIMARY KEY,
            tenant_id UUID NOT NULL,
            title TEXT NOT NULL CHECK (title <> ''),
            body TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        ALTER TABLE core.note ENABLE ROW LEVEL SECURITY;
        ALTER TABLE core.note FORCE ROW LEVEL SECURITY;
        DROP POLICY IF EXISTS tenant_isolation ON core.note;
        CREATE POLICY tenant_isolation ON core.note
            USING (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid)
            WITH CHECK (tenant_id = nullif(current_setting('app.tenant_id', true), '')::uuid);
        "#,
    )
    .execute(pool)
    .await
    .map_err(DataError::during("initialize note schema"))?;
    Ok(())
}

/// Writes the note and its `note.created` event in one transaction.
pub async fn create_note(
    State(state): State<AppState>,
    CurrentTenant(tenant): CurrentTenant,
    correlation_id: CorrelationId,
    idempotency_key: Option<Extension<IdempotencyKey>>,
    Json(request): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<CreateNoteResponse>), ApiError> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("title is required".to_string()));
    }

    let tenant_id = tenant.tenant.id;
    let note_id = Uuid::new_v4();

    let mut conn = state.connections.open_route(&tenant).await?;
    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .map_err(DataError::during("begin note write"))?;

    sqlx::query("INSERT INTO core.note (note_id, tenant_id, title, body) VALUES ($1, $2, $3, $4)")
        .bind(note_id)
        .bind(tenant_id.as_uuid())
        .bind(title)
        .bind(&request.body)
        .execute(&mut *tx)
        .await
        .map_err(DataError::during("insert note"))?;

    let payload = serde_json::json!({ "noteId": note_id, "title": title }).to_string();
    let mut message = OutboxMessage::new(tenant_id, NOTES_QUEUE, NOTE_CREATED, payload)
        .with_correlation_id(correlation_id.0);
    if let Some(Extension(IdempotencyKey(key))) = idempotency_key {
        message = message.with_idempotency_key(key);
    }
    let outbox_id = state.outbox.enqueue(&mut *tx, &message).await?;

    tx.commit().await.map_err(DataError::during("commit note write"))?;

    info!(tenant_id = %tenant_id, note_id = %note_id, outbox_id = %outbox_id, "Note created");
    Ok((StatusCode::CREATED, Json(CreateNoteResponse { note_id, outbox_id })))
}
