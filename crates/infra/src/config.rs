//! Outbox configuration loading and representation.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::outbox::DEFAULT_MAX_RETRIES;

pub const ENV_WORKERS: &str = "MAINTOPS_OUTBOX_WORKERS";
pub const ENV_POLL_MS: &str = "MAINTOPS_OUTBOX_POLL_MS";
pub const ENV_BATCH_SIZE: &str = "MAINTOPS_OUTBOX_BATCH_SIZE";
pub const ENV_MAX_RETRIES: &str = "MAINTOPS_OUTBOX_MAX_RETRIES";
pub const ENV_MAX_ROUNDS: &str = "MAINTOPS_OUTBOX_MAX_ROUNDS";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Outbox settings shared by the pipeline and the workers.
///
/// Deserialization goes through [`validate`](OutboxConfig::validate), so a
/// zero count, interval or budget never reaches a worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawOutboxConfig")]
pub struct OutboxConfig {
    /// Concurrent workers in a worker group.
    pub worker_count: usize,
    /// Idle sleep between polls when the queue is drained.
    pub poll_interval: Duration,
    /// Messages handled per batch.
    pub batch_size: usize,
    /// Delivery attempts before dead-lettering (stamped on new rows).
    pub max_retries: u32,
    /// Cap on in-transaction dispatch rounds per command.
    pub max_dispatch_rounds: usize,
    pub database_url: Option<String>,
}

/// Unchecked wire form of [`OutboxConfig`].
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawOutboxConfig {
    worker_count: usize,
    #[serde(with = "duration_ms")]
    poll_interval_ms: Duration,
    batch_size: usize,
    max_retries: u32,
    max_dispatch_rounds: usize,
    database_url: Option<String>,
}

impl Default for RawOutboxConfig {
    fn default() -> Self {
        let defaults = OutboxConfig::default();
        Self {
            worker_count: defaults.worker_count,
            poll_interval_ms: defaults.poll_interval,
            batch_size: defaults.batch_size,
            max_retries: defaults.max_retries,
            max_dispatch_rounds: defaults.max_dispatch_rounds,
            database_url: defaults.database_url,
        }
    }
}

impl TryFrom<RawOutboxConfig> for OutboxConfig {
    type Error = ConfigError;

    fn try_from(raw: RawOutboxConfig) -> Result<Self, Self::Error> {
        let config = Self {
            worker_count: raw.worker_count,
            poll_interval: raw.poll_interval_ms,
            batch_size: raw.batch_size,
            max_retries: raw.max_retries,
            max_dispatch_rounds: raw.max_dispatch_rounds,
            database_url: raw.database_url.filter(|u| !u.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            max_dispatch_rounds: 50,
            database_url: None,
        }
    }
}

impl OutboxConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_dispatch_rounds(mut self, rounds: usize) -> Self {
        self.max_dispatch_rounds = rounds;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Defaults overridden by `MAINTOPS_OUTBOX_*` and `DATABASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = positive(&lookup, ENV_WORKERS)? {
            config.worker_count = v as usize;
        }
        if let Some(v) = positive(&lookup, ENV_POLL_MS)? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = positive(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = v as usize;
        }
        if let Some(v) = positive(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = u32::try_from(v).map_err(|_| ConfigError::InvalidNumber {
                key: ENV_MAX_RETRIES,
                value: v.to_string(),
            })?;
        }
        if let Some(v) = positive(&lookup, ENV_MAX_ROUNDS)? {
            config.max_dispatch_rounds = v as usize;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|u| !u.trim().is_empty()) {
            config.database_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Every count, interval and budget must be non-zero; a zero
    /// `max_retries` would strand rows that can never be claimed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("worker_count", self.worker_count == 0),
            ("poll_interval_ms", self.poll_interval.is_zero()),
            ("batch_size", self.batch_size == 0),
            ("max_retries", self.max_retries == 0),
            ("max_dispatch_rounds", self.max_dispatch_rounds == 0),
        ];
        match zero.into_iter().find(|(_, is_zero)| *is_zero) {
            Some((key, _)) => Err(ConfigError::Zero { key }),
            None => Ok(()),
        }
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL))
    }
}

fn positive<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: raw.clone(),
    })?;
    if value == 0 {
        return Err(ConfigError::Zero { key });
    }
    Ok(Some(value))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
