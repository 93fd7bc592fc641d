use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use grantflow_core::{DeadLetter, DeadLetterKind, OpportunityDetail, Watermark};
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::kv::{DeadLetterStore, FieldMap, OpportunityStore, StoreError, WatermarkStore};
use crate::queue::{Delivery, QueueError, WorkQueue};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

fn store_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Fatal(err.to_string()),
    }
}

fn queue_error(err: sqlx::Error) -> QueueError {
    QueueError::Unavailable(err.to_string())
}

/// Postgres-backed opportunity rows, watermarks and dead letters.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn merge_upsert(
        &self,
        partition: &str,
        row_key: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let fields = serde_json::to_value(fields).map_err(|e| StoreError::Fatal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO opportunities (partition_key, row_key, fields)
            VALUES ($1, $2, $3)
            ON CONFLICT (partition_key, row_key)
            DO UPDATE SET fields = opportunities.fields || EXCLUDED.fields
            "#,
        )
        .bind(partition)
        .bind(row_key)
        .bind(fields)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, partition: &str, row_key: &str) -> Result<Option<FieldMap>, StoreError> {
        let row = sqlx::query(
            "SELECT fields FROM opportunities WHERE partition_key = $1 AND row_key = $2",
        )
        .bind(partition)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let fields: JsonValue = row.try_get("fields").map_err(store_error)?;
        serde_json::from_value(fields)
            .map(Some)
            .map_err(|e| StoreError::Fatal(e.to_string()))
    }

    async fn delete(&self, partition: &str, row_key: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM opportunities WHERE partition_key = $1 AND row_key = $2")
                .bind(partition)
                .bind(row_key)
                .execute(&self.pool)
                .await
                .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn updated_before(
        &self,
        partition: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<String>, StoreError> {
        // ISO dates compare correctly as text.
        let rows = sqlx::query(
            r#"
            SELECT row_key
              FROM opportunities
             WHERE partition_key = $1
               AND fields ->> 'last_updated' IS NOT NULL
               AND fields ->> 'last_updated' < $2
             ORDER BY row_key
            "#,
        )
        .bind(partition)
        .bind(cutoff.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("row_key").map_err(store_error))
            .collect()
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn load_watermark(&self, name: &str) -> Result<Watermark, StoreError> {
        let row = sqlx::query(
            "SELECT last_discovery_run_at, last_seen_close_date_cursor FROM watermarks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        let Some(row) = row else {
            return Ok(Watermark::default());
        };
        Ok(Watermark {
            last_discovery_run_at: row.try_get("last_discovery_run_at").map_err(store_error)?,
            last_seen_close_date_cursor: row
                .try_get("last_seen_close_date_cursor")
                .map_err(store_error)?,
        })
    }

    async fn save_watermark(&self, name: &str, watermark: &Watermark) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (name, last_discovery_run_at, last_seen_close_date_cursor)
            VALUES ($1, $2, $3)
            ON CONFLICT (name)
            DO UPDATE SET last_discovery_run_at = EXCLUDED.last_discovery_run_at,
                          last_seen_close_date_cursor = EXCLUDED.last_seen_close_date_cursor
            "#,
        )
        .bind(name)
        .bind(watermark.last_discovery_run_at)
        .bind(watermark.last_seen_close_date_cursor)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for PgStore {
    async fn record(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let detail = letter
            .detail
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Fatal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, kind, reason, attempts, last_error, recorded_at, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id, kind)
            DO UPDATE SET reason = EXCLUDED.reason,
                          attempts = EXCLUDED.attempts,
                          last_error = EXCLUDED.last_error,
                          recorded_at = EXCLUDED.recorded_at,
                          detail = EXCLUDED.detail
            "#,
        )
        .bind(&letter.id)
        .bind(letter.kind.as_str())
        .bind(&letter.reason)
        .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
        .bind(&letter.last_error)
        .bind(letter.recorded_at)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, reason, attempts, last_error, recorded_at, detail
              FROM dead_letters
             ORDER BY recorded_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind").map_err(store_error)?;
            let attempts: i32 = row.try_get("attempts").map_err(store_error)?;
            let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(store_error)?;
            let detail: Option<JsonValue> = row.try_get("detail").map_err(store_error)?;
            let detail = detail
                .map(serde_json::from_value::<OpportunityDetail>)
                .transpose()
                .map_err(|e| StoreError::Fatal(e.to_string()))?;
            out.push(DeadLetter {
                id: row.try_get("id").map_err(store_error)?,
                kind: kind.parse().map_err(StoreError::Fatal)?,
                reason: row.try_get("reason").map_err(store_error)?,
                attempts: u32::try_from(attempts).unwrap_or(0),
                last_error: row.try_get("last_error").map_err(store_error)?,
                recorded_at,
                detail,
            });
        }
        Ok(out)
    }

    async fn remove(&self, id: &str, kind: DeadLetterKind) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1 AND kind = $2")
            .bind(id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Visibility-timeout queue on the `work_queue` table.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn send(&self, body: &str) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();
        sqlx::query("INSERT INTO work_queue (message_id, body) VALUES ($1, $2)")
            .bind(message_id)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        Ok(message_id)
    }

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let receipt = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE work_queue
               SET visible_at = now() + make_interval(secs => $1),
                   receipt = $2,
                   dequeue_count = dequeue_count + 1
             WHERE message_id = (
                   SELECT message_id
                     FROM work_queue
                    WHERE visible_at <= now()
                    ORDER BY enqueued_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED)
            RETURNING message_id, body, dequeue_count
            "#,
        )
        .bind(visibility_timeout.as_secs_f64())
        .bind(receipt)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let dequeue_count: i32 = row.try_get("dequeue_count").map_err(queue_error)?;
        Ok(Some(Delivery {
            message_id: row.try_get("message_id").map_err(queue_error)?,
            body: row.try_get("body").map_err(queue_error)?,
            receipt,
            dequeue_count: u32::try_from(dequeue_count).unwrap_or(0),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM work_queue WHERE message_id = $1 AND receipt = $2")
            .bind(delivery.message_id)
            .bind(delivery.receipt)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::StaleReceipt(delivery.receipt));
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
               SET visible_at = now(), receipt = NULL
             WHERE message_id = $1 AND receipt = $2
            "#,
        )
        .bind(delivery.message_id)
        .bind(delivery.receipt)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::StaleReceipt(delivery.receipt));
        }
        Ok(())
    }

    async fn approximate_len(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(queue_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_retryable() {
        assert!(store_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!store_error(sqlx::Error::RowNotFound).is_retryable());
    }
}
