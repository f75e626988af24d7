use async_trait::async_trait;
use thiserror::Error;

use maintops_core::DomainError;

use crate::{Event, UnitOfWork};

/// Failure reported by an event handler.
///
/// The variant decides how the failure is treated downstream:
///
/// - `Connectivity`: the database (or another piece of infrastructure) is
///   unreachable. Workers abort the batch and leave the message claimable;
///   it is never counted as a delivery failure.
/// - everything else: the handler could not process this event. Inside a
///   business transaction it aborts the command; in a worker it is recorded
///   as a retry.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("infrastructure unavailable: {0}")]
    Connectivity(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl core::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{msg}"))
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// Handler executed synchronously inside the business transaction.
///
/// Runs before commit with full access to the unit of work: it may write
/// through `uow.tx()` and raise further events (which the pipeline dispatches
/// in the next round). Any error aborts the whole business operation.
#[async_trait]
pub trait TransactionalHandler<E, T>: Send + Sync
where
    E: Event,
    T: Send,
{
    async fn handle(&self, event: &E, uow: &mut UnitOfWork<T>) -> Result<(), HandlerError>;
}

/// Handler executed later by an outbox worker, outside the business transaction.
///
/// Runs inside the worker's short per-message transaction. Delivery is
/// at-least-once from the handler's point of view if its own side effects
/// escape that transaction, so such handlers must be idempotent.
#[async_trait]
pub trait DeferredHandler<E, T>: Send + Sync
where
    E: Event,
    T: Send,
{
    async fn handle(&self, event: &E, tx: &mut T) -> Result<(), HandlerError>;
}

/// A business command (intent to change state).
///
/// Commands are transient; the events they produce are what gets recorded.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable command name used in logs (e.g. "maintenance.work_order.complete").
    fn name(&self) -> &'static str;
}

/// Executes one command against a unit of work.
///
/// Implementations load and mutate aggregates through `uow.tx()` and
/// `register` them so their events reach the pipeline.
#[async_trait]
pub trait CommandHandler<T: Send>: Send + Sync {
    type Cmd: Command;
    type Output: Send;
    type Error: core::fmt::Debug + Send + Sync + 'static;

    async fn handle(
        &self,
        command: Self::Cmd,
        uow: &mut UnitOfWork<T>,
    ) -> Result<Self::Output, Self::Error>;
}
