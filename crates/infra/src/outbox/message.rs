use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use maintops_core::MessageId;
use maintops_events::RaisedEvent;

/// Delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest diagnostic stored in `last_error`, in characters.
pub const MAX_ERROR_CHARS: usize = 2000;

/// One row of the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub event_type: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    /// `None` while pending.
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub max_retries: u32,
}

impl QueuedMessage {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: MessageId::new(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Serialize a raised event into a fresh pending row.
    pub fn from_event(event: &RaisedEvent, max_retries: u32) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.event_type(), event.to_payload()?).with_max_retries(max_retries))
    }

    /// Retry budget for this row. Zero is raised to one: a row with no budget
    /// could never be claimed nor dead-lettered.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    /// Pending and still within its retry budget.
    pub fn is_claimable(&self) -> bool {
        self.is_pending() && !RetryPolicy::is_exhausted(self.retry_count, self.max_retries)
    }
}

/// A message that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub message: QueuedMessage,
    pub moved_to_dead_letter_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(message: QueuedMessage) -> Self {
        Self {
            message,
            moved_to_dead_letter_at: Utc::now(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// Back to a claimable pending row. The last error is kept for operators.
    pub fn into_requeued(self) -> QueuedMessage {
        QueuedMessage {
            processed_at: None,
            retry_count: 0,
            ..self.message
        }
    }
}

/// Result of recording a failed delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Still pending; will be claimed again.
    Retrying { retry_count: u32 },
    /// Moved to the dead-letter table in the same transaction.
    DeadLettered { retry_count: u32 },
}

impl RetryOutcome {
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryOutcome::Retrying { retry_count } | RetryOutcome::DeadLettered { retry_count } => {
                *retry_count
            }
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RetryOutcome::DeadLettered { .. })
    }
}

/// Retry and dead-letter rules shared by every store implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// A message with this many failures must leave the pending table.
    pub fn is_exhausted(retry_count: u32, max_retries: u32) -> bool {
        retry_count >= max_retries
    }

    /// Cap a diagnostic at [`MAX_ERROR_CHARS`] characters.
    pub fn truncate_error(error: &str) -> String {
        match error.char_indices().nth(MAX_ERROR_CHARS) {
            Some((byte_idx, _)) => error[..byte_idx].to_string(),
            None => error.to_string(),
        }
    }
}
