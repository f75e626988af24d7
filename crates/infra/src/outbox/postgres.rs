//! Postgres-backed outbox store.
//!
//! ## Claiming
//!
//! `claim_next` uses `FOR UPDATE SKIP LOCKED`, so concurrent workers never
//! block on each other and a row is only ever held by one transaction. The
//! partial index on `(processed_at, retry_count, created_at)` keeps the claim
//! query on the pending subset.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `Io`, `Tls`, `PoolTimedOut`, `PoolClosed`, `WorkerCrashed` | `Connectivity` |
//! | Database, unique violation (`23505`) | `Conflict` |
//! | `ColumnDecode`, `Decode` | `Serialization` |
//! | anything else | `Database` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use maintops_core::MessageId;
use maintops_events::HandlerError;

use super::message::{DeadLetterMessage, QueuedMessage, RetryOutcome, RetryPolicy};
use super::store::{OutboxAdmin, OutboxStats, OutboxStore, StoreError};

// One savepoint level is all the worker needs.
const SAVEPOINT_SQL: &str = "SAVEPOINT outbox_dispatch";
const ROLLBACK_TO_SAVEPOINT_SQL: &str = "ROLLBACK TO SAVEPOINT outbox_dispatch";
const RELEASE_SAVEPOINT_SQL: &str = "RELEASE SAVEPOINT outbox_dispatch";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pending_messages (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        max_retries INTEGER NOT NULL DEFAULT 3
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pending_messages_claim
        ON pending_messages (processed_at, retry_count, created_at)
        WHERE processed_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letter_messages (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ NULL,
        retry_count INTEGER NOT NULL,
        last_error TEXT NULL,
        max_retries INTEGER NOT NULL,
        moved_to_dead_letter_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_dead_letter_messages_moved
        ON dead_letter_messages (moved_to_dead_letter_at)
    "#,
];

/// Postgres outbox over `pending_messages` and `dead_letter_messages`.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create both outbox tables and their indexes if missing. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }

    async fn savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        sqlx::query(SAVEPOINT_SQL)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        sqlx::query(ROLLBACK_TO_SAVEPOINT_SQL)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("rollback_to_savepoint", e))?;
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        sqlx::query(RELEASE_SAVEPOINT_SQL)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("release_savepoint", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, tx, message),
        fields(message_id = %message.id, event_type = %message.event_type),
        err
    )]
    async fn add(&self, tx: &mut Self::Tx, message: &QueuedMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_messages (
                id,
                event_type,
                payload,
                created_at,
                processed_at,
                retry_count,
                last_error,
                max_retries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.processed_at)
        .bind(message.retry_count as i32)
        .bind(&message.last_error)
        .bind(message.max_retries as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("add", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn claim_next(&self, tx: &mut Self::Tx) -> Result<Option<QueuedMessage>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                event_type,
                payload,
                created_at,
                processed_at,
                retry_count,
                last_error,
                max_retries
            FROM pending_messages
            WHERE processed_at IS NULL AND retry_count < max_retries
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        match row {
            Some(row) => {
                let row = MessageRow::from_row(&row)
                    .map_err(|e| map_sqlx_error("claim_next", e))?;
                Ok(Some(row.into()))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, tx), fields(message_id = %id), err)]
    async fn mark_processed(&self, tx: &mut Self::Tx, id: MessageId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pending_messages
            SET processed_at = NOW()
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, error), fields(message_id = %id), err)]
    async fn increment_retry(
        &self,
        tx: &mut Self::Tx,
        id: MessageId,
        error: &str,
    ) -> Result<RetryOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE pending_messages
            SET retry_count = retry_count + 1, last_error = $2
            WHERE id = $1 AND processed_at IS NULL
            RETURNING retry_count, max_retries
            "#,
        )
        .bind(id.as_uuid())
        .bind(RetryPolicy::truncate_error(error))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("increment_retry", e))?
        .ok_or(StoreError::NotFound(id))?;

        let retry_count: i32 = row
            .try_get("retry_count")
            .map_err(|e| map_sqlx_error("increment_retry", e))?;
        let max_retries: i32 = row
            .try_get("max_retries")
            .map_err(|e| map_sqlx_error("increment_retry", e))?;
        let retry_count = retry_count.max(0) as u32;

        if !RetryPolicy::is_exhausted(retry_count, max_retries.max(0) as u32) {
            return Ok(RetryOutcome::Retrying { retry_count });
        }

        sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM pending_messages
                WHERE id = $1
                RETURNING id, event_type, payload, created_at, processed_at,
                          retry_count, last_error, max_retries
            )
            INSERT INTO dead_letter_messages (
                id, event_type, payload, created_at, processed_at,
                retry_count, last_error, max_retries, moved_to_dead_letter_at
            )
            SELECT id, event_type, payload, created_at, processed_at,
                   retry_count, last_error, max_retries, NOW()
            FROM moved
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;

        tracing::warn!(message_id = %id, retry_count, "message dead-lettered");
        Ok(RetryOutcome::DeadLettered { retry_count })
    }
}

#[async_trait]
impl OutboxAdmin for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM pending_messages WHERE processed_at IS NULL) AS pending,
                (SELECT COUNT(*) FROM pending_messages WHERE processed_at IS NOT NULL) AS processed,
                (SELECT COUNT(*) FROM dead_letter_messages) AS dead_lettered
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            processed: count("processed")?,
            dead_lettered: count("dead_lettered")?,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                event_type,
                payload,
                created_at,
                processed_at,
                retry_count,
                last_error,
                max_retries,
                moved_to_dead_letter_at
            FROM dead_letter_messages
            ORDER BY moved_to_dead_letter_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        let mut dead_letters = Vec::with_capacity(rows.len());
        for row in rows {
            let message = MessageRow::from_row(&row)
                .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
            let moved_to_dead_letter_at: DateTime<Utc> = row
                .try_get("moved_to_dead_letter_at")
                .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
            dead_letters.push(DeadLetterMessage {
                message: message.into(),
                moved_to_dead_letter_at,
            });
        }
        Ok(dead_letters)
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn requeue_dead_letter(&self, id: MessageId) -> Result<QueuedMessage, StoreError> {
        let row = sqlx::query(
            r#"
            WITH revived AS (
                DELETE FROM dead_letter_messages
                WHERE id = $1
                RETURNING id, event_type, payload, created_at, last_error, max_retries
            )
            INSERT INTO pending_messages (
                id, event_type, payload, created_at, processed_at,
                retry_count, last_error, max_retries
            )
            SELECT id, event_type, payload, created_at, NULL, 0, last_error, max_retries
            FROM revived
            RETURNING id, event_type, payload, created_at, processed_at,
                      retry_count, last_error, max_retries
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?
        .ok_or(StoreError::NotFound(id))?;

        let row = MessageRow::from_row(&row).map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(row.into())
    }

    #[instrument(skip(self), fields(message_id = %id), err)]
    async fn delete_dead_letter(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM dead_letter_messages WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM pending_messages WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_processed", e))?;
        Ok(result.rows_affected())
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connectivity {
            operation,
            message: err.to_string(),
        },
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            StoreError::Conflict(format!("{operation}: {db_err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{operation}: {err}"))
        }
        _ => StoreError::Database {
            operation,
            message: err.to_string(),
        },
    }
}

/// Classify a SQLx error raised inside a deferred handler.
///
/// Connectivity problems abort the worker's batch instead of burning a retry.
pub fn classify(err: sqlx::Error) -> HandlerError {
    map_sqlx_error("handler", err).into()
}

// SQLx row types
#[derive(Debug)]
struct MessageRow {
    id: uuid::Uuid,
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
    max_retries: i32,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            max_retries: row.try_get("max_retries")?,
        })
    }
}

impl From<MessageRow> for QueuedMessage {
    fn from(row: MessageRow) -> Self {
        QueuedMessage {
            id: MessageId::from_uuid(row.id),
            event_type: row.event_type,
            payload: row.payload,
            created_at: row.created_at,
            processed_at: row.processed_at,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
            max_retries: row.max_retries.max(0) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_connectivity() {
        assert!(map_sqlx_error("claim_next", sqlx::Error::PoolTimedOut).is_connectivity());
        assert!(map_sqlx_error("claim_next", sqlx::Error::PoolClosed).is_connectivity());
        assert!(classify(sqlx::Error::PoolTimedOut).is_connectivity());
    }

    #[test]
    fn missing_rows_are_plain_database_errors() {
        let err = map_sqlx_error("requeue_dead_letter", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database { operation: "requeue_dead_letter", .. }));
        assert!(!classify(sqlx::Error::RowNotFound).is_connectivity());
    }

    #[test]
    fn schema_is_idempotent_ddl() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"));
        }
    }

    /// Wipes both outbox tables; point it at a throwaway database.
    const TEST_DATABASE_URL: &str = "MAINTOPS_TEST_DATABASE_URL";

    // cargo test -p maintops-infra -- --ignored
    #[tokio::test]
    #[ignore = "needs a disposable Postgres in MAINTOPS_TEST_DATABASE_URL"]
    async fn concurrent_claims_skip_locked_rows_and_exhausted_rows_dead_letter() {
        let Ok(url) = std::env::var(TEST_DATABASE_URL) else {
            return;
        };
        let store = PostgresOutboxStore::connect(&url, 4).await.unwrap();
        store.ensure_schema().await.unwrap();
        sqlx::query("TRUNCATE pending_messages, dead_letter_messages")
            .execute(store.pool())
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        for n in 0..2 {
            let message = QueuedMessage::new("test.claim", serde_json::json!({ "n": n }))
                .with_max_retries(1);
            store.add(&mut tx, &message).await.unwrap();
        }
        store.commit(tx).await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut third = store.begin().await.unwrap();
        let a = store.claim_next(&mut first).await.unwrap().unwrap();
        let b = store.claim_next(&mut second).await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!(store.claim_next(&mut third).await.unwrap().is_none());
        store.rollback(third).await.unwrap();
        store.rollback(second).await.unwrap();

        let outcome = store.increment_retry(&mut first, a.id, "boom").await.unwrap();
        assert_eq!(outcome, RetryOutcome::DeadLettered { retry_count: 1 });
        store.commit(first).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.pending, stats.dead_lettered), (1, 1));
        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id(), a.id);
        assert_eq!(dead[0].message.last_error.as_deref(), Some("boom"));
    }
}
