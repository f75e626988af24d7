//! Handler registry: routes events to their handlers by stable type tag.
//!
//! Each tag maps to a route that knows how to decode a stored payload back
//! into its Rust type and which handlers consume it. Handlers are stored
//! type-erased; the typed value is recovered with a checked downcast, so a
//! new event type only needs to be registered at startup.

use core::any::TypeId;
use core::marker::PhantomData;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{DeferredHandler, Event, HandlerError, RaisedEvent, TransactionalHandler, UnitOfWork};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type '{event_type}' is already bound to {existing}")]
    DuplicateEventType {
        event_type: &'static str,
        existing: &'static str,
    },
}

/// Failure to turn a stored `(event_type, payload)` pair back into an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("failed to decode '{event_type}' payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload stored as '{stored}' decodes to '{decoded}'")]
    TagMismatch {
        stored: String,
        decoded: &'static str,
    },
}

#[async_trait]
trait TransactionalSlot<T: Send>: Send + Sync {
    async fn invoke(&self, event: &RaisedEvent, uow: &mut UnitOfWork<T>)
    -> Result<(), HandlerError>;
}

#[async_trait]
trait DeferredSlot<T: Send>: Send + Sync {
    async fn invoke(&self, event: &RaisedEvent, tx: &mut T) -> Result<(), HandlerError>;
}

struct Binding<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> Binding<E, H> {
    fn new(handler: H) -> Self {
        Self {
            handler,
            _event: PhantomData,
        }
    }
}

fn downcast<E: Event>(event: &RaisedEvent) -> Result<&E, HandlerError> {
    event.downcast_ref::<E>().ok_or_else(|| {
        HandlerError::failed(format!(
            "event '{}' is not a {}",
            event.event_type(),
            core::any::type_name::<E>()
        ))
    })
}

#[async_trait]
impl<E, H, T> TransactionalSlot<T> for Binding<E, H>
where
    E: Event,
    H: TransactionalHandler<E, T>,
    T: Send + 'static,
{
    async fn invoke(
        &self,
        event: &RaisedEvent,
        uow: &mut UnitOfWork<T>,
    ) -> Result<(), HandlerError> {
        let typed = downcast::<E>(event)?;
        self.handler.handle(typed, uow).await
    }
}

#[async_trait]
impl<E, H, T> DeferredSlot<T> for Binding<E, H>
where
    E: Event,
    H: DeferredHandler<E, T>,
    T: Send + 'static,
{
    async fn invoke(&self, event: &RaisedEvent, tx: &mut T) -> Result<(), HandlerError> {
        let typed = downcast::<E>(event)?;
        self.handler.handle(typed, tx).await
    }
}

type DecodeFn = fn(&JsonValue) -> Result<RaisedEvent, serde_json::Error>;

fn decode_as<E: Event>(payload: &JsonValue) -> Result<RaisedEvent, serde_json::Error> {
    E::deserialize(payload).map(RaisedEvent::new)
}

struct Route<T> {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
    transactional: Vec<Arc<dyn TransactionalSlot<T>>>,
    deferred: Vec<Arc<dyn DeferredSlot<T>>>,
}

/// Tag → (decoder, transactional handlers, deferred handlers).
///
/// `T` is the transaction handle handlers run against. Handlers for one tag
/// run in registration order.
pub struct HandlerRegistry<T> {
    routes: HashMap<&'static str, Route<T>>,
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<T> core::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (tag, route) in &self.routes {
            map.entry(
                tag,
                &format_args!(
                    "{} (transactional: {}, deferred: {})",
                    route.type_name,
                    route.transactional.len(),
                    route.deferred.len()
                ),
            );
        }
        map.finish()
    }
}

impl<T: Send + 'static> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every tag of `E` decodable, even if no handler consumes it.
    ///
    /// Registering the same type twice is a no-op; binding a tag that belongs
    /// to a different type is an error and registers nothing.
    pub fn register_event<E: Event>(&mut self) -> Result<&mut Self, RegistryError> {
        let type_id = TypeId::of::<E>();
        for tag in E::event_types() {
            if let Some(route) = self.routes.get(tag) {
                if route.type_id != type_id {
                    return Err(RegistryError::DuplicateEventType {
                        event_type: tag,
                        existing: route.type_name,
                    });
                }
            }
        }

        for tag in E::event_types() {
            self.routes.entry(tag).or_insert_with(|| Route {
                type_id,
                type_name: core::any::type_name::<E>(),
                decode: decode_as::<E>,
                transactional: Vec::new(),
                deferred: Vec::new(),
            });
        }
        Ok(self)
    }

    pub fn on_transactional<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        H: TransactionalHandler<E, T> + 'static,
    {
        self.register_event::<E>()?;
        let slot: Arc<dyn TransactionalSlot<T>> = Arc::new(Binding::<E, H>::new(handler));
        for tag in E::event_types() {
            if let Some(route) = self.routes.get_mut(tag) {
                route.transactional.push(Arc::clone(&slot));
            }
        }
        Ok(self)
    }

    pub fn on_deferred<E, H>(&mut self, handler: H) -> Result<&mut Self, RegistryError>
    where
        E: Event,
        H: DeferredHandler<E, T> + 'static,
    {
        self.register_event::<E>()?;
        let slot: Arc<dyn DeferredSlot<T>> = Arc::new(Binding::<E, H>::new(handler));
        for tag in E::event_types() {
            if let Some(route) = self.routes.get_mut(tag) {
                route.deferred.push(Arc::clone(&slot));
            }
        }
        Ok(self)
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    /// `(transactional, deferred)` handler counts for a tag.
    pub fn handler_counts(&self, event_type: &str) -> (usize, usize) {
        self.routes
            .get(event_type)
            .map(|r| (r.transactional.len(), r.deferred.len()))
            .unwrap_or((0, 0))
    }

    /// Run every transactional handler for the event, stopping at the first error.
    ///
    /// Events without a route have no transactional handlers; that is not an error.
    pub async fn dispatch_transactional(
        &self,
        event: &RaisedEvent,
        uow: &mut UnitOfWork<T>,
    ) -> Result<usize, HandlerError> {
        let Some(route) = self.routes.get(event.event_type()) else {
            return Ok(0);
        };
        for slot in &route.transactional {
            slot.invoke(event, uow).await?;
        }
        Ok(route.transactional.len())
    }

    /// Rebuild a typed event from its stored form.
    pub fn decode(&self, event_type: &str, payload: &JsonValue) -> Result<RaisedEvent, DecodeError> {
        let route = self
            .routes
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))?;

        let event = (route.decode)(payload).map_err(|source| DecodeError::Payload {
            event_type: event_type.to_string(),
            source,
        })?;

        if event.event_type() != event_type {
            return Err(DecodeError::TagMismatch {
                stored: event_type.to_string(),
                decoded: event.event_type(),
            });
        }
        Ok(event)
    }

    /// Run every deferred handler for the event, stopping at the first error.
    pub async fn dispatch_deferred(
        &self,
        event: &RaisedEvent,
        tx: &mut T,
    ) -> Result<usize, HandlerError> {
        let Some(route) = self.routes.get(event.event_type()) else {
            return Ok(0);
        };
        for slot in &route.deferred {
            slot.invoke(event, tx).await?;
        }
        Ok(route.deferred.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum DoorEvent {
        Opened { at: DateTime<Utc> },
        Closed { at: DateTime<Utc> },
    }

    impl Event for DoorEvent {
        fn event_type(&self) -> &'static str {
            match self {
                DoorEvent::Opened { .. } => "door.opened",
                DoorEvent::Closed { .. } => "door.closed",
            }
        }

        fn event_types() -> &'static [&'static str] {
            &["door.opened", "door.closed"]
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            match self {
                DoorEvent::Opened { at } | DoorEvent::Closed { at } => *at,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Impostor;

    impl Event for Impostor {
        fn event_type(&self) -> &'static str {
            "door.opened"
        }

        fn event_types() -> &'static [&'static str] {
            &["door.opened", "impostor.only"]
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Appends its label to the transaction log.
    struct Log(&'static str);

    #[async_trait]
    impl DeferredHandler<DoorEvent, Vec<String>> for Log {
        async fn handle(&self, event: &DoorEvent, tx: &mut Vec<String>) -> Result<(), HandlerError> {
            tx.push(format!("{}:{}", self.0, event.event_type()));
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionalHandler<DoorEvent, Vec<String>> for Log {
        async fn handle(
            &self,
            event: &DoorEvent,
            uow: &mut UnitOfWork<Vec<String>>,
        ) -> Result<(), HandlerError> {
            uow.tx().push(format!("{}:{}", self.0, event.event_type()));
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl DeferredHandler<DoorEvent, Vec<String>> for Refuse {
        async fn handle(&self, _event: &DoorEvent, _tx: &mut Vec<String>) -> Result<(), HandlerError> {
            Err(HandlerError::failed("door jammed"))
        }
    }

    fn opened() -> DoorEvent {
        DoorEvent::Opened { at: Utc::now() }
    }

    #[test]
    fn tag_owned_by_another_type_is_rejected_atomically() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.register_event::<DoorEvent>().unwrap();

        let err = registry.register_event::<Impostor>().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateEventType { event_type: "door.opened", .. }));
        assert!(!registry.is_registered("impostor.only"));

        // Same type again is fine.
        registry.register_event::<DoorEvent>().unwrap();
    }

    #[tokio::test]
    async fn deferred_handlers_run_in_registration_order() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.on_deferred::<DoorEvent, _>(Log("first")).unwrap();
        registry.on_deferred::<DoorEvent, _>(Log("second")).unwrap();

        let event = RaisedEvent::new(DoorEvent::Closed { at: Utc::now() });
        let mut tx = Vec::new();
        let ran = registry.dispatch_deferred(&event, &mut tx).await.unwrap();

        assert_eq!(ran, 2);
        assert_eq!(tx, vec!["first:door.closed", "second:door.closed"]);
    }

    #[tokio::test]
    async fn first_failing_deferred_handler_stops_dispatch() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.on_deferred::<DoorEvent, _>(Refuse).unwrap();
        registry.on_deferred::<DoorEvent, _>(Log("after")).unwrap();

        let mut tx = Vec::new();
        let err = registry
            .dispatch_deferred(&RaisedEvent::new(opened()), &mut tx)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "door jammed");
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn transactional_dispatch_without_route_is_a_no_op() {
        let registry = HandlerRegistry::<Vec<String>>::new();
        let mut uow = UnitOfWork::new(Vec::new());

        let ran = registry
            .dispatch_transactional(&RaisedEvent::new(opened()), &mut uow)
            .await
            .unwrap();
        assert_eq!(ran, 0);
    }

    #[tokio::test]
    async fn transactional_handlers_see_the_unit_of_work() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.on_transactional::<DoorEvent, _>(Log("tx")).unwrap();
        assert_eq!(registry.handler_counts("door.opened"), (1, 0));

        let mut uow = UnitOfWork::new(Vec::new());
        registry
            .dispatch_transactional(&RaisedEvent::new(opened()), &mut uow)
            .await
            .unwrap();
        assert_eq!(uow.into_transaction(), vec!["tx:door.opened"]);
    }

    #[test]
    fn decode_round_trips_a_stored_payload() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.register_event::<DoorEvent>().unwrap();

        let original = opened();
        let payload = serde_json::to_value(&original).unwrap();
        let decoded = registry.decode("door.opened", &payload).unwrap();

        assert_eq!(decoded.downcast_ref::<DoorEvent>(), Some(&original));
    }

    #[test]
    fn decode_fails_loudly() {
        let mut registry = HandlerRegistry::<Vec<String>>::new();
        registry.register_event::<DoorEvent>().unwrap();

        let unknown = registry.decode("window.opened", &serde_json::json!({}));
        assert!(matches!(unknown, Err(DecodeError::UnknownEventType(t)) if t == "window.opened"));

        let garbage = registry.decode("door.opened", &serde_json::json!({"nope": 1}));
        assert!(matches!(garbage, Err(DecodeError::Payload { .. })));

        let closed = serde_json::to_value(DoorEvent::Closed { at: Utc::now() }).unwrap();
        let mismatched = registry.decode("door.opened", &closed);
        assert!(matches!(mismatched, Err(DecodeError::TagMismatch { decoded: "door.closed", .. })));
    }
}
