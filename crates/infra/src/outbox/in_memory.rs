//! In-memory outbox store for tests/dev.
//!
//! Transactions buffer their writes and apply them under one lock on commit.
//! Row locks live in a shared set so that claims from concurrent
//! transactions skip each other the way `FOR UPDATE SKIP LOCKED` does.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use maintops_core::MessageId;

use super::message::{DeadLetterMessage, QueuedMessage, RetryOutcome, RetryPolicy};
use super::store::{OutboxAdmin, OutboxStats, OutboxStore, StoreError};

#[derive(Debug)]
struct Row {
    // insertion order, tie-break for equal `created_at`
    seq: u64,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    rows: HashMap<MessageId, Row>,
    dead_letters: HashMap<MessageId, DeadLetterMessage>,
    locked: HashSet<MessageId>,
}

impl State {
    fn push_row(&mut self, message: QueuedMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(message.id, Row { seq, message });
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
struct Changes {
    inserted: Vec<QueuedMessage>,
    // working copies of committed rows this transaction holds locked
    updated: HashMap<MessageId, QueuedMessage>,
    dead_lettered: Vec<DeadLetterMessage>,
}

impl Changes {
    fn is_dead_lettered(&self, id: MessageId) -> bool {
        self.dead_lettered.iter().any(|d| d.id() == id)
    }
}

/// Transaction handle of [`InMemoryOutboxStore`].
#[derive(Debug)]
pub struct InMemoryTx {
    state: Arc<Mutex<State>>,
    changes: Changes,
    savepoint: Option<Changes>,
    locks: HashSet<MessageId>,
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let mut state = lock_state(&self.state);
        for id in self.locks.drain() {
            state.locked.remove(&id);
        }
    }
}

fn acquire(tx: &mut InMemoryTx, state: &mut State, id: MessageId) -> Result<(), StoreError> {
    if tx.locks.contains(&id) {
        return Ok(());
    }
    if state.locked.contains(&id) {
        return Err(StoreError::Conflict(format!(
            "message {id} is locked by another transaction"
        )));
    }
    state.locked.insert(id);
    tx.locks.insert(id);
    Ok(())
}

/// Committed row as seen through the transaction's own pending updates.
fn committed_view(tx: &InMemoryTx, state: &State, id: MessageId) -> Option<QueuedMessage> {
    if tx.changes.is_dead_lettered(id) {
        return None;
    }
    tx.changes
        .updated
        .get(&id)
        .or_else(|| state.rows.get(&id).map(|row| &row.message))
        .cloned()
}

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Committed state of a pending or processed row.
    pub fn message(&self, id: MessageId) -> Option<QueuedMessage> {
        lock_state(&self.state)
            .rows
            .get(&id)
            .map(|row| row.message.clone())
    }

    pub fn dead_letter(&self, id: MessageId) -> Option<DeadLetterMessage> {
        lock_state(&self.state).dead_letters.get(&id).cloned()
    }

    /// Every committed row (pending and processed) in claim order.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        let state = lock_state(&self.state);
        let mut rows: Vec<&Row> = state.rows.values().collect();
        rows.sort_by_key(|row| (row.message.created_at, row.seq));
        rows.into_iter().map(|row| row.message.clone()).collect()
    }

    /// Rows currently locked by open transactions.
    pub fn locked_count(&self) -> usize {
        lock_state(&self.state).locked.len()
    }

    fn guard<'a>(&'a self, tx: &InMemoryTx) -> Result<MutexGuard<'a, State>, StoreError> {
        if !Arc::ptr_eq(&self.state, &tx.state) {
            return Err(StoreError::Conflict(
                "transaction belongs to a different store".to_string(),
            ));
        }
        Ok(lock_state(&self.state))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        Ok(InMemoryTx {
            state: Arc::clone(&self.state),
            changes: Changes::default(),
            savepoint: None,
            locks: HashSet::new(),
        })
    }

    async fn commit(&self, mut tx: InMemoryTx) -> Result<(), StoreError> {
        let mut state = self.guard(&tx)?;
        let changes = std::mem::take(&mut tx.changes);

        for (id, message) in changes.updated {
            if let Some(row) = state.rows.get_mut(&id) {
                row.message = message;
            }
        }
        for message in changes.inserted {
            state.push_row(message);
        }
        for dead in changes.dead_lettered {
            state.rows.remove(&dead.id());
            state.dead_letters.insert(dead.id(), dead);
        }
        for id in tx.locks.drain() {
            state.locked.remove(&id);
        }
        Ok(())
    }

    async fn rollback(&self, tx: InMemoryTx) -> Result<(), StoreError> {
        drop(self.guard(&tx)?);
        drop(tx);
        Ok(())
    }

    async fn savepoint(&self, tx: &mut InMemoryTx) -> Result<(), StoreError> {
        drop(self.guard(tx)?);
        tx.savepoint = Some(tx.changes.clone());
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut InMemoryTx) -> Result<(), StoreError> {
        drop(self.guard(tx)?);
        tx.changes = tx
            .savepoint
            .clone()
            .ok_or_else(|| StoreError::Conflict("no active savepoint".to_string()))?;
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut InMemoryTx) -> Result<(), StoreError> {
        drop(self.guard(tx)?);
        tx.savepoint
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Conflict("no active savepoint".to_string()))
    }

    async fn add(&self, tx: &mut InMemoryTx, message: &QueuedMessage) -> Result<(), StoreError> {
        let state = self.guard(tx)?;
        let exists = state.rows.contains_key(&message.id)
            || state.dead_letters.contains_key(&message.id)
            || tx.changes.inserted.iter().any(|m| m.id == message.id);
        if exists {
            return Err(StoreError::Conflict(format!(
                "message {} already exists",
                message.id
            )));
        }
        drop(state);

        tx.changes.inserted.push(message.clone());
        Ok(())
    }

    async fn claim_next(&self, tx: &mut InMemoryTx) -> Result<Option<QueuedMessage>, StoreError> {
        let mut state = self.guard(tx)?;

        let committed = state
            .rows
            .values()
            .filter_map(|row| {
                committed_view(tx, &state, row.message.id).map(|message| (row.seq, message))
            })
            .filter(|(_, m)| m.is_claimable())
            .filter(|(_, m)| !state.locked.contains(&m.id) || tx.locks.contains(&m.id))
            .min_by_key(|(seq, m)| (m.created_at, *seq));

        let own = tx
            .changes
            .inserted
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_claimable())
            .map(|(idx, m)| (state.next_seq + idx as u64, m.clone()))
            .min_by_key(|(seq, m)| (m.created_at, *seq));

        let next = match (committed, own) {
            (Some(c), Some(o)) => {
                if (o.1.created_at, o.0) < (c.1.created_at, c.0) {
                    return Ok(Some(o.1));
                }
                c.1
            }
            (Some(c), None) => c.1,
            (None, Some(o)) => return Ok(Some(o.1)),
            (None, None) => return Ok(None),
        };

        acquire(tx, &mut state, next.id)?;
        Ok(Some(next))
    }

    async fn mark_processed(&self, tx: &mut InMemoryTx, id: MessageId) -> Result<(), StoreError> {
        let mut state = self.guard(tx)?;

        if let Some(message) = tx.changes.inserted.iter_mut().find(|m| m.id == id) {
            message.processed_at.get_or_insert_with(Utc::now);
            return Ok(());
        }

        let Some(mut message) = committed_view(tx, &state, id) else {
            return Ok(());
        };
        if message.processed_at.is_some() {
            return Ok(());
        }

        acquire(tx, &mut state, id)?;
        message.processed_at = Some(Utc::now());
        tx.changes.updated.insert(id, message);
        Ok(())
    }

    async fn increment_retry(
        &self,
        tx: &mut InMemoryTx,
        id: MessageId,
        error: &str,
    ) -> Result<RetryOutcome, StoreError> {
        let mut state = self.guard(tx)?;
        let error = RetryPolicy::truncate_error(error);

        if let Some(pos) = tx.changes.inserted.iter().position(|m| m.id == id) {
            let message = &mut tx.changes.inserted[pos];
            if message.processed_at.is_some() {
                return Err(StoreError::NotFound(id));
            }
            message.retry_count += 1;
            message.last_error = Some(error);
            let retry_count = message.retry_count;

            if RetryPolicy::is_exhausted(retry_count, message.max_retries) {
                let message = tx.changes.inserted.remove(pos);
                tx.changes.dead_lettered.push(DeadLetterMessage::new(message));
                return Ok(RetryOutcome::DeadLettered { retry_count });
            }
            return Ok(RetryOutcome::Retrying { retry_count });
        }

        let mut message = match committed_view(tx, &state, id) {
            Some(message) if message.is_pending() => message,
            _ => return Err(StoreError::NotFound(id)),
        };

        acquire(tx, &mut state, id)?;
        message.retry_count += 1;
        message.last_error = Some(error);
        let retry_count = message.retry_count;

        if RetryPolicy::is_exhausted(retry_count, message.max_retries) {
            tx.changes.updated.remove(&id);
            tx.changes.dead_lettered.push(DeadLetterMessage::new(message));
            Ok(RetryOutcome::DeadLettered { retry_count })
        } else {
            tx.changes.updated.insert(id, message);
            Ok(RetryOutcome::Retrying { retry_count })
        }
    }
}

#[async_trait]
impl OutboxAdmin for InMemoryOutboxStore {
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let state = lock_state(&self.state);
        let pending = state.rows.values().filter(|r| r.message.is_pending()).count() as u64;
        Ok(OutboxStats {
            pending,
            processed: state.rows.len() as u64 - pending,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let state = lock_state(&self.state);
        let mut result: Vec<_> = state.dead_letters.values().cloned().collect();
        result.sort_by_key(|d| (d.moved_to_dead_letter_at, d.id()));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_dead_letter(&self, id: MessageId) -> Result<QueuedMessage, StoreError> {
        let mut state = lock_state(&self.state);
        let dead = state
            .dead_letters
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;

        let message = dead.into_requeued();
        state.push_row(message.clone());
        Ok(message)
    }

    async fn delete_dead_letter(&self, id: MessageId) -> Result<(), StoreError> {
        lock_state(&self.state)
            .dead_letters
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = lock_state(&self.state);
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| !matches!(row.message.processed_at, Some(at) if at < older_than));
        Ok((before - state.rows.len()) as u64)
    }
}
