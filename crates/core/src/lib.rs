//! `maintops-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, EventSource};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, MessageId};
