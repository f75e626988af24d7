use core::any::Any;
use core::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **serializable** (deferred consumers receive them from the durable queue)
/// - identified by a **stable type tag** that survives process restarts
///
/// One Rust type may carry several tags (an enum with one variant per fact).
/// `event_types()` must list every tag `event_type()` can return, so the
/// handler registry can route a stored payload back to this type.
pub trait Event: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "maintenance.work_order.completed").
    fn event_type(&self) -> &'static str;

    /// Every tag this type can produce.
    fn event_types() -> &'static [&'static str];

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

trait ErasedEvent: Any + fmt::Debug + Send + Sync {
    fn encode(&self) -> Result<JsonValue, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> ErasedEvent for E {
    fn encode(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type-erased event raised during a unit of work.
///
/// Carries the tag and timestamp alongside the typed value so the pipeline
/// can route and serialize it without knowing the concrete type.
#[derive(Debug)]
pub struct RaisedEvent {
    event_type: &'static str,
    occurred_at: DateTime<Utc>,
    event: Box<dyn ErasedEvent>,
}

impl RaisedEvent {
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            event_type: event.event_type(),
            occurred_at: event.occurred_at(),
            event: Box::new(event),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Borrow the typed event, if it is an `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }

    /// Serialize the event body for durable storage.
    pub fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        self.event.encode()
    }
}
