//! Durable queue store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use maintops_core::MessageId;
use maintops_events::HandlerError;

use super::message::{DeadLetterMessage, QueuedMessage, RetryOutcome};

/// Outbox store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached (pool exhausted, IO, TLS). Never a
    /// property of the message being processed.
    #[error("outbox store unavailable during {operation}: {message}")]
    Connectivity {
        operation: &'static str,
        message: String,
    },

    #[error("database error during {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    #[error("outbox message not found: {0}")]
    NotFound(MessageId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity { .. })
    }
}

impl From<StoreError> for HandlerError {
    fn from(value: StoreError) -> Self {
        if value.is_connectivity() {
            HandlerError::Connectivity(value.to_string())
        } else {
            HandlerError::Failed(anyhow::Error::new(value))
        }
    }
}

/// Row counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processed: u64,
    pub dead_lettered: u64,
}

/// Transactional access to the durable queue.
///
/// Every operation runs inside an explicit transaction handle. Dropping a
/// `Tx` without committing it rolls it back and releases its row locks.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Mark a point that `rollback_to_savepoint` can return to. One level.
    async fn savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError>;

    /// Discard writes made since `savepoint`; row locks taken earlier stay held.
    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError>;

    async fn release_savepoint(&self, tx: &mut Self::Tx) -> Result<(), StoreError>;

    /// Insert a pending row as part of the caller's transaction.
    async fn add(&self, tx: &mut Self::Tx, message: &QueuedMessage) -> Result<(), StoreError>;

    /// Lock and return the oldest claimable row.
    ///
    /// Rows locked by other transactions are skipped, never waited on. The lock
    /// lasts until the transaction ends.
    async fn claim_next(&self, tx: &mut Self::Tx) -> Result<Option<QueuedMessage>, StoreError>;

    /// Set `processed_at` if it is still unset. Repeated calls are no-ops.
    async fn mark_processed(&self, tx: &mut Self::Tx, id: MessageId) -> Result<(), StoreError>;

    /// Record a failed delivery; dead-letters the row once its budget is spent.
    async fn increment_retry(
        &self,
        tx: &mut Self::Tx,
        id: MessageId,
        error: &str,
    ) -> Result<RetryOutcome, StoreError>;
}

/// Operator surface over the queue. Each call is its own transaction.
#[async_trait]
pub trait OutboxAdmin: Send + Sync {
    async fn stats(&self) -> Result<OutboxStats, StoreError>;

    /// Oldest dead letters first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, StoreError>;

    /// Move a dead letter back to the pending table with a fresh retry budget.
    async fn requeue_dead_letter(&self, id: MessageId) -> Result<QueuedMessage, StoreError>;

    async fn delete_dead_letter(&self, id: MessageId) -> Result<(), StoreError>;

    /// Delete processed rows older than the cutoff. Returns how many went.
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_survives_conversion_to_handler_error() {
        let err: HandlerError = StoreError::Connectivity {
            operation: "claim_next",
            message: "pool timed out".into(),
        }
        .into();
        assert!(err.is_connectivity());

        let err: HandlerError = StoreError::NotFound(MessageId::new()).into();
        assert!(!err.is_connectivity());
    }
}
