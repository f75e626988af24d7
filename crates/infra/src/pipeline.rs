//! In-transaction event dispatch and command execution.
//!
//! ```text
//! Command
//!   ↓
//! 1. Begin transaction (UnitOfWork owns it)
//!   ↓
//! 2. Handle command (mutate aggregates, register them)
//!   ↓
//! 3. Event pipeline stage:
//!      dispatch transactional handlers round by round
//!      then enqueue every event in the same transaction
//!   ↓
//! 4. Commit (or roll back everything on any error)
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use maintops_events::{Command, CommandHandler, HandlerError, HandlerRegistry, UnitOfWork};

use crate::config::OutboxConfig;
use crate::outbox::{DEFAULT_MAX_RETRIES, OutboxStore, QueuedMessage, StoreError};

pub const DEFAULT_MAX_DISPATCH_ROUNDS: usize = 50;

/// Failure of a business command or of the pipeline around it.
///
/// `E` is the command handler's own error; the event stage alone uses the
/// uninhabited default.
#[derive(Debug, Error)]
pub enum PipelineError<E = Infallible> {
    /// The command handler rejected the command.
    #[error("command failed: {0:?}")]
    Command(E),

    /// A transactional handler failed; nothing was enqueued.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Handlers kept raising events past the configured cap.
    #[error("event dispatch did not settle within {max_rounds} rounds")]
    DispatchRoundsExceeded { max_rounds: usize },

    #[error("failed to serialize {event_type}: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    fn into_command_error<E>(self) -> PipelineError<E> {
        match self {
            PipelineError::Command(never) => match never {},
            PipelineError::Handler(e) => PipelineError::Handler(e),
            PipelineError::DispatchRoundsExceeded { max_rounds } => {
                PipelineError::DispatchRoundsExceeded { max_rounds }
            }
            PipelineError::Serialization { event_type, source } => {
                PipelineError::Serialization { event_type, source }
            }
            PipelineError::Store(e) => PipelineError::Store(e),
        }
    }
}

/// Runs transactional handlers and records every event in the outbox.
///
/// Runs once per command, after the handler and before commit. Events raised
/// by transactional handlers form the next dispatch round. Rows are added only
/// after every round succeeded, so a handler failure leaves no trace.
pub struct EventPipelineStage<S: OutboxStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry<S::Tx>>,
    max_dispatch_rounds: usize,
    max_retries: u32,
}

impl<S: OutboxStore> EventPipelineStage<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry<S::Tx>>) -> Self {
        Self {
            store,
            registry,
            max_dispatch_rounds: DEFAULT_MAX_DISPATCH_ROUNDS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn from_config(
        store: Arc<S>,
        registry: Arc<HandlerRegistry<S::Tx>>,
        config: &OutboxConfig,
    ) -> Self {
        Self::new(store, registry)
            .with_max_dispatch_rounds(config.max_dispatch_rounds)
            .with_max_retries(config.max_retries)
    }

    pub fn with_max_dispatch_rounds(mut self, rounds: usize) -> Self {
        self.max_dispatch_rounds = rounds.max(1);
        self
    }

    /// Retry budget stamped on rows this stage enqueues (at least one).
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry<S::Tx>> {
        &self.registry
    }

    /// Dispatch and enqueue. Returns the number of rows added.
    pub async fn run(&self, uow: &mut UnitOfWork<S::Tx>) -> Result<usize, PipelineError> {
        let mut deferred = Vec::new();
        let mut rounds = 0usize;

        loop {
            let batch = uow.collect_and_clear_domain_events();
            if batch.is_empty() {
                break;
            }

            rounds += 1;
            if rounds > self.max_dispatch_rounds {
                warn!(
                    max_rounds = self.max_dispatch_rounds,
                    "event dispatch exceeded its round cap"
                );
                return Err(PipelineError::DispatchRoundsExceeded {
                    max_rounds: self.max_dispatch_rounds,
                });
            }

            for event in batch {
                let handled = self
                    .registry
                    .dispatch_transactional(&event, uow)
                    .await
                    .inspect_err(|e| {
                        warn!(event_type = event.event_type(), error = %e, "transactional handler failed");
                    })?;
                debug!(event_type = event.event_type(), round = rounds, handled, "event dispatched");
                deferred.push(event);
            }
        }

        for event in &deferred {
            let message = QueuedMessage::from_event(event, self.max_retries).map_err(|source| {
                PipelineError::Serialization {
                    event_type: event.event_type(),
                    source,
                }
            })?;
            self.store.add(uow.tx(), &message).await?;
            debug!(message_id = %message.id, event_type = %message.event_type, "event enqueued");
        }

        Ok(deferred.len())
    }
}

/// Reusable command execution engine.
///
/// Owns the transaction boundary: one transaction per command, committed only
/// if the handler and the event stage both succeeded. Every error rolls the
/// transaction back and is returned unchanged.
pub struct CommandPipeline<S: OutboxStore> {
    stage: EventPipelineStage<S>,
}

impl<S: OutboxStore> CommandPipeline<S> {
    pub fn new(stage: EventPipelineStage<S>) -> Self {
        Self { stage }
    }

    pub fn stage(&self) -> &EventPipelineStage<S> {
        &self.stage
    }

    pub async fn execute<H>(
        &self,
        handler: &H,
        command: H::Cmd,
    ) -> Result<H::Output, PipelineError<H::Error>>
    where
        H: CommandHandler<S::Tx>,
    {
        let store = self.stage.store();
        let name = command.name();
        let mut uow = UnitOfWork::new(store.begin().await?);

        let output = match handler.handle(command, &mut uow).await {
            Ok(output) => output,
            Err(err) => {
                debug!(command = name, error = ?err, "command rejected");
                self.abort(uow, name).await;
                return Err(PipelineError::Command(err));
            }
        };

        match self.stage.run(&mut uow).await {
            Ok(enqueued) => {
                store.commit(uow.into_transaction()).await?;
                debug!(command = name, enqueued, "command committed");
                Ok(output)
            }
            Err(err) => {
                self.abort(uow, name).await;
                Err(err.into_command_error())
            }
        }
    }

    async fn abort(&self, uow: UnitOfWork<S::Tx>, command: &'static str) {
        if let Err(err) = self.stage.store().rollback(uow.into_transaction()).await {
            warn!(command, error = %err, "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use maintops_events::{Event, TransactionalHandler};

    use super::*;
    use crate::outbox::{InMemoryOutboxStore, InMemoryTx, OutboxAdmin, RetryOutcome};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        depth: u32,
        at: DateTime<Utc>,
    }

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "test.ping"
        }

        fn event_types() -> &'static [&'static str] {
            &["test.ping"]
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    /// Raises another ping until `depth` reaches `stop`.
    struct Echo {
        stop: u32,
    }

    #[async_trait]
    impl TransactionalHandler<Ping, InMemoryTx> for Echo {
        async fn handle(
            &self,
            event: &Ping,
            uow: &mut UnitOfWork<InMemoryTx>,
        ) -> Result<(), HandlerError> {
            if event.depth < self.stop {
                uow.raise(Ping {
                    depth: event.depth + 1,
                    at: Utc::now(),
                });
            }
            Ok(())
        }
    }

    fn stage_with(stop: u32) -> (Arc<InMemoryOutboxStore>, EventPipelineStage<InMemoryOutboxStore>) {
        let store = InMemoryOutboxStore::arc();
        let mut registry: HandlerRegistry<InMemoryTx> = HandlerRegistry::new();
        registry.on_transactional::<Ping, _>(Echo { stop }).unwrap();
        let stage = EventPipelineStage::new(Arc::clone(&store), Arc::new(registry));
        (store, stage)
    }

    #[tokio::test]
    async fn handler_raised_events_are_all_enqueued() {
        let (store, stage) = stage_with(3);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.raise(Ping { depth: 0, at: Utc::now() });

        assert_eq!(stage.run(&mut uow).await.unwrap(), 4);
        assert!(!uow.has_pending_events());
        store.commit(uow.into_transaction()).await.unwrap();
        assert_eq!(store.stats().await.unwrap().pending, 4);
    }

    #[tokio::test]
    async fn runaway_cascades_hit_the_round_cap() {
        let (store, stage) = stage_with(u32::MAX);
        let stage = stage.with_max_dispatch_rounds(5);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.raise(Ping { depth: 0, at: Utc::now() });

        let err = stage.run(&mut uow).await.unwrap_err();
        assert!(matches!(err, PipelineError::DispatchRoundsExceeded { max_rounds: 5 }));
        store.commit(uow.into_transaction()).await.unwrap();
        assert_eq!(store.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn exactly_the_cap_is_allowed() {
        let (store, stage) = stage_with(4);
        let stage = stage.with_max_dispatch_rounds(5);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.raise(Ping { depth: 0, at: Utc::now() });

        assert_eq!(stage.run(&mut uow).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn empty_unit_of_work_enqueues_nothing() {
        let (store, stage) = stage_with(0);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        assert_eq!(stage.run(&mut uow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_rows_carry_the_configured_budget() {
        let (store, stage) = stage_with(0);
        let stage = stage.with_max_retries(7);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.raise(Ping { depth: 0, at: Utc::now() });
        stage.run(&mut uow).await.unwrap();
        store.commit(uow.into_transaction()).await.unwrap();

        let rows = store.messages();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].max_retries, 7);
        assert_eq!(rows[0].event_type, "test.ping");
        assert_eq!(rows[0].payload["depth"], 0);
    }

    #[tokio::test]
    async fn zero_budget_rows_are_still_delivered_once() {
        let (store, stage) = stage_with(0);
        let stage = stage.with_max_retries(0);
        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.raise(Ping { depth: 0, at: Utc::now() });
        stage.run(&mut uow).await.unwrap();
        store.commit(uow.into_transaction()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let claimed = store.claim_next(&mut tx).await.unwrap().unwrap();
        assert_eq!(claimed.max_retries, 1);
        let outcome = store.increment_retry(&mut tx, claimed.id, "boom").await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(outcome, RetryOutcome::DeadLettered { retry_count: 1 });
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.pending, stats.dead_lettered), (0, 1));
    }
}
