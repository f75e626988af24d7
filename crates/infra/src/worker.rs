//! Claim-and-dispatch outbox worker.
//!
//! Each message is handled in its own short transaction:
//!
//! ```text
//! begin → claim_next (SKIP LOCKED) → savepoint → deferred handlers
//!   ok:     release savepoint → mark_processed → commit
//!   failed: rollback to savepoint → increment_retry → commit
//!   connectivity: rollback, abort the batch
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use maintops_core::MessageId;
use maintops_events::{HandlerError, HandlerRegistry};

use crate::config::OutboxConfig;
use crate::outbox::{OutboxStore, QueuedMessage, RetryOutcome, StoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The database or a handler's backing service is unreachable. The
    /// message in flight was rolled back and stays claimable.
    #[error("outbox infrastructure unavailable: {0}")]
    Infrastructure(String),

    /// Queue bookkeeping failed for a reason other than connectivity.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for WorkerError {
    fn from(value: StoreError) -> Self {
        if value.is_connectivity() {
            WorkerError::Infrastructure(value.to_string())
        } else {
            WorkerError::Store(value)
        }
    }
}

/// Where a worker is in its cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Dispatching,
    Succeeded,
    Failed,
    Stopped,
}

/// What happened to one claimed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed { id: MessageId, handlers: usize },
    Retried { id: MessageId, retry_count: u32 },
    DeadLettered { id: MessageId, retry_count: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// The queue had nothing claimable before the batch was full.
    pub drained: bool,
}

impl BatchReport {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Processed { .. } => self.processed += 1,
            MessageOutcome::Retried { .. } => self.retried += 1,
            MessageOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    pub fn handled(&self) -> usize {
        self.processed + self.retried + self.dead_lettered
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub messages_processed: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub infrastructure_errors: u64,
}

/// Polls the outbox and delivers messages to deferred handlers.
pub struct OutboxWorker<S: OutboxStore> {
    name: String,
    store: Arc<S>,
    registry: Arc<HandlerRegistry<S::Tx>>,
    batch_size: usize,
    poll_interval: Duration,
    state: watch::Sender<WorkerState>,
    stats: Mutex<WorkerStats>,
}

impl<S: OutboxStore> OutboxWorker<S> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        registry: Arc<HandlerRegistry<S::Tx>>,
    ) -> Self {
        let defaults = OutboxConfig::default();
        Self {
            name: name.into(),
            store,
            registry,
            batch_size: defaults.batch_size,
            poll_interval: defaults.poll_interval,
            state: watch::Sender::new(WorkerState::Idle),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        store: Arc<S>,
        registry: Arc<HandlerRegistry<S::Tx>>,
        config: &OutboxConfig,
    ) -> Self {
        Self::new(name, store, registry)
            .with_batch_size(config.batch_size)
            .with_poll_interval(config.poll_interval)
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle up to `batch_size` messages.
    pub async fn process_batch(&self) -> Result<BatchReport, WorkerError> {
        self.batch(None).await
    }

    /// Poll until `shutdown` flips to `true` (or its sender goes away).
    ///
    /// Shutdown is observed between messages, so a claimed message is always
    /// committed or rolled back before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "outbox worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.batch(Some(&shutdown)).await {
                Ok(report) => report.drained,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "outbox batch aborted");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        info!(worker = %self.name, "outbox worker stopped");
    }

    async fn batch(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<BatchReport, WorkerError> {
        let mut report = BatchReport::default();

        for _ in 0..self.batch_size {
            if shutdown.is_some_and(|s| *s.borrow()) {
                break;
            }
            match self.process_next().await {
                Ok(Some(outcome)) => report.record(&outcome),
                Ok(None) => {
                    report.drained = true;
                    break;
                }
                Err(err) => {
                    self.update_stats(|s| s.infrastructure_errors += 1);
                    return Err(err);
                }
            }
        }

        self.update_stats(|s| {
            s.batches += 1;
            s.messages_processed += report.processed as u64;
            s.messages_retried += report.retried as u64;
            s.messages_dead_lettered += report.dead_lettered as u64;
        });
        Ok(report)
    }

    /// Claim and handle a single message. `None` when nothing is claimable.
    pub async fn process_next(&self) -> Result<Option<MessageOutcome>, WorkerError> {
        self.state.send_replace(WorkerState::Claiming);
        let mut tx = self.store.begin().await?;

        let message = match self.store.claim_next(&mut tx).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.state.send_replace(WorkerState::Idle);
                self.store.rollback(tx).await?;
                return Ok(None);
            }
            Err(err) => return Err(self.abort(tx, err).await),
        };

        self.state.send_replace(WorkerState::Dispatching);
        debug!(
            worker = %self.name,
            message_id = %message.id,
            event_type = %message.event_type,
            retry_count = message.retry_count,
            "claimed message"
        );

        if let Err(err) = self.store.savepoint(&mut tx).await {
            return Err(self.abort(tx, err).await);
        }

        match self.deliver(&message, &mut tx).await {
            Ok(handlers) => self.succeed(tx, &message, handlers).await.map(Some),
            Err(err) if err.is_connectivity() => {
                self.state.send_replace(WorkerState::Failed);
                warn!(
                    worker = %self.name,
                    message_id = %message.id,
                    error = %err,
                    "handler lost connectivity, aborting batch"
                );
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    warn!(worker = %self.name, error = %rollback_err, "rollback failed");
                }
                Err(WorkerError::Infrastructure(err.to_string()))
            }
            Err(err) => self.fail(tx, &message, err).await.map(Some),
        }
    }

    async fn deliver(&self, message: &QueuedMessage, tx: &mut S::Tx) -> Result<usize, HandlerError> {
        let event = self
            .registry
            .decode(&message.event_type, &message.payload)
            .map_err(|e| HandlerError::Failed(anyhow::Error::new(e)))?;
        self.registry.dispatch_deferred(&event, tx).await
    }

    async fn succeed(
        &self,
        mut tx: S::Tx,
        message: &QueuedMessage,
        handlers: usize,
    ) -> Result<MessageOutcome, WorkerError> {
        if let Err(err) = self.store.release_savepoint(&mut tx).await {
            return Err(self.abort(tx, err).await);
        }
        if let Err(err) = self.store.mark_processed(&mut tx, message.id).await {
            return Err(self.abort(tx, err).await);
        }
        self.store.commit(tx).await?;

        self.state.send_replace(WorkerState::Succeeded);
        debug!(worker = %self.name, message_id = %message.id, handlers, "message processed");
        Ok(MessageOutcome::Processed {
            id: message.id,
            handlers,
        })
    }

    async fn fail(
        &self,
        mut tx: S::Tx,
        message: &QueuedMessage,
        err: HandlerError,
    ) -> Result<MessageOutcome, WorkerError> {
        self.state.send_replace(WorkerState::Failed);

        if let Err(store_err) = self.store.rollback_to_savepoint(&mut tx).await {
            return Err(self.abort(tx, store_err).await);
        }
        let outcome = match self
            .store
            .increment_retry(&mut tx, message.id, &err.to_string())
            .await
        {
            Ok(outcome) => outcome,
            Err(store_err) => return Err(self.abort(tx, store_err).await),
        };
        self.store.commit(tx).await?;

        Ok(match outcome {
            RetryOutcome::Retrying { retry_count } => {
                warn!(
                    worker = %self.name,
                    message_id = %message.id,
                    event_type = %message.event_type,
                    retry_count,
                    error = %err,
                    "delivery failed, will retry"
                );
                MessageOutcome::Retried {
                    id: message.id,
                    retry_count,
                }
            }
            RetryOutcome::DeadLettered { retry_count } => {
                error!(
                    worker = %self.name,
                    message_id = %message.id,
                    event_type = %message.event_type,
                    retry_count,
                    error = %err,
                    "delivery failed, message dead-lettered"
                );
                MessageOutcome::DeadLettered {
                    id: message.id,
                    retry_count,
                }
            }
        })
    }

    async fn abort(&self, tx: S::Tx, err: StoreError) -> WorkerError {
        self.state.send_replace(WorkerState::Failed);
        if let Err(rollback_err) = self.store.rollback(tx).await {
            warn!(worker = %self.name, error = %rollback_err, "rollback failed");
        }
        err.into()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
