use crate::{validate, Result};
use sqlx::PgConnection;
use tb_common::{DataError, OutboxMessage};
use tracing::debug;
use uuid::Uuid;

/// Appends outbox rows on a connection the caller already holds inside a
/// transaction. The row commits or rolls back with the business write.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub fn new() -> Self {
        Self
    }

    /// Inserts `message` and returns its outbox id. Never touches the queue.
    pub async fn enqueue(&self, tx: &mut PgConnection, message: &OutboxMessage) -> Result<Uuid> {
        validate(message)?;
        let outbox_id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO core.outbox_message (
                outbox_id, tenant_id, queue_name, message_type, payload,
                correlation_id, idempotency_key, available_at
            )
            VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7, coalesce($8, now()))
            "#,
        )
        .bind(outbox_id)
        .bind(message.tenant_id.as_uuid())
        .bind(&message.queue_name)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.correlation_id)
        .bind(&message.idempotency_key)
        .bind(message.available_at)
        .execute(&mut *tx)
        .await
        .map_err(DataError::during("enqueue outbox message"))?;

        debug!(
            outbox_id = %outbox_id,
            tenant_id = %message.tenant_id,
            queue = %message.queue_name,
            message_type = %message.message_type,
            "Enqueued outbox message"
        );
        Ok(outbox_id)
    }
}
