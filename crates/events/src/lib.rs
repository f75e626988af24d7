//! `maintops-events` — domain events, units of work and handler routing.
//!
//! Mechanics only: nothing here knows about storage. The outbox
//! infrastructure plugs its transaction type in as `T`.

pub mod event;
pub mod handler;
pub mod registry;
pub mod unit_of_work;

pub use event::{Event, RaisedEvent};
pub use handler::{Command, CommandHandler, DeferredHandler, HandlerError, TransactionalHandler};
pub use registry::{DecodeError, HandlerRegistry, RegistryError};
pub use unit_of_work::UnitOfWork;
