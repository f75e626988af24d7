//! Infrastructure layer: durable outbox, event pipeline, workers, config.

pub mod config;
pub mod outbox;
pub mod pipeline;
pub mod worker;


pub use config::{ConfigError, OutboxConfig};
pub use outbox::{
    DeadLetterMessage, InMemoryOutboxStore, OutboxAdmin, OutboxStats, OutboxStore,
    PostgresOutboxStore, QueuedMessage, RetryOutcome, RetryPolicy, StoreError,
};
pub use pipeline::{CommandPipeline, EventPipelineStage, PipelineError};
pub use worker::{BatchReport, MessageOutcome, OutboxWorker, WorkerError, WorkerState, WorkerStats};
