//! Durable queue (transactional outbox).
//!
//! Rows are written inside business transactions by the event pipeline and
//! consumed later by [`crate::worker::OutboxWorker`].

pub mod in_memory;
pub mod message;
pub mod postgres;
pub mod store;

pub use in_memory::{InMemoryOutboxStore, InMemoryTx};
pub use message::{
    DEFAULT_MAX_RETRIES, DeadLetterMessage, MAX_ERROR_CHARS, QueuedMessage, RetryOutcome,
    RetryPolicy,
};
pub use postgres::{PostgresOutboxStore, classify};
pub use store::{OutboxAdmin, OutboxStats, OutboxStore, StoreError};
