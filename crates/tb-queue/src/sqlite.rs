//! Embedded queue backed by a SQLite table, for single-node deployments.

use crate::{QueueClient, QueueError, ReceivedMessage, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct SqliteQueue {
    pool: SqlitePool,
    identifier: String,
}

fn backend(err: sqlx::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, identifier: impl Into<String>) -> Self {
        Self {
            pool,
            identifier: identifier.into(),
        }
    }

    /// Opens (creating if needed) the database at `url` and initializes the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);
        // in-memory databases are per connection
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let queue = Self::new(pool, format!("sqlite:{}", url));
        queue.init_schema().await?;
        Ok(queue)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                message_id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                body TEXT NOT NULL,
                dequeue_count INTEGER NOT NULL DEFAULT 0,
                visible_at INTEGER NOT NULL,
                expires_at INTEGER,
                receipt_handle TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
                ON queue_messages(queue_name, visible_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        info!(queue = %self.identifier, "SQLite queue schema initialized");
        Ok(())
    }

    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM queue_messages WHERE queue_name = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.get("depth"))
    }
}

#[async_trait]
impl QueueClient for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn send(&self, queue: &str, body: &str, time_to_live: Option<Duration>) -> Result<String> {
        let now = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO queue_messages (message_id, queue_name, body, visible_at, expires_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(queue)
        .bind(body)
        .bind(now)
        .bind(time_to_live.map(|ttl| now.saturating_add(millis(ttl))))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now.saturating_add(millis(visibility_timeout));
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(queue)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let rows = sqlx::query(
            r#"
            SELECT message_id, body, dequeue_count
            FROM queue_messages
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at, rowid
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(i64::from(max_messages))
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let mut received = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: String = row.get("message_id");
            let dequeue_count: i64 = row.get("dequeue_count");
            let receipt = Uuid::new_v4().to_string();

            sqlx::query(
                "UPDATE queue_messages SET dequeue_count = dequeue_count + 1, visible_at = ?, receipt_handle = ? WHERE message_id = ?",
            )
            .bind(visible_at)
            .bind(&receipt)
            .bind(&message_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            received.push(ReceivedMessage {
                message_id,
                receipt_handle: receipt,
                dequeue_count: u32::try_from(dequeue_count + 1).unwrap_or(u32::MAX),
                body: row.get("body"),
            });
        }

        tx.commit().await.map_err(backend)?;
        Ok(received)
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM queue_messages WHERE queue_name = ? AND message_id = ? AND receipt_handle = ?",
        )
        .bind(queue)
        .bind(&message.message_id)
        .bind(&message.receipt_handle)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if deleted.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM queue_messages WHERE message_id = ?")
                .bind(&message.message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            if exists.is_some() {
                return Err(QueueError::StaleReceipt(message.message_id.clone()));
            }
        }
        Ok(())
    }
}
