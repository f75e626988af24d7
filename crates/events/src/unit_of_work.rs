//! Unit of work: one business transaction plus the events raised inside it.

use maintops_core::EventSource;

use crate::{Event, RaisedEvent};

/// Explicit transaction context for a single business command.
///
/// Owns the transaction handle `T` (passed by `&mut` to everything that must
/// write atomically with the business change) and the queue of domain events
/// raised so far. Nothing here is global: whoever holds the unit of work
/// holds the transaction.
///
/// Aggregates buffer their own events; `register` drains that buffer into
/// the unit of work. Call it after each mutation of an aggregate.
#[derive(Debug)]
pub struct UnitOfWork<T> {
    tx: T,
    raised: Vec<RaisedEvent>,
}

impl<T> UnitOfWork<T> {
    pub fn new(tx: T) -> Self {
        Self {
            tx,
            raised: Vec::new(),
        }
    }

    /// The ambient transaction.
    pub fn tx(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Collect the events an aggregate raised since it was last registered.
    pub fn register<A>(&mut self, aggregate: &mut A)
    where
        A: EventSource,
        A::Event: Event,
    {
        for event in aggregate.take_events() {
            self.raised.push(RaisedEvent::new(event));
        }
    }

    /// Record an event that is not attached to an aggregate.
    pub fn raise<E: Event>(&mut self, event: E) {
        self.raised.push(RaisedEvent::new(event));
    }

    /// Take every event raised so far, oldest first.
    ///
    /// Returns an empty batch once drained; may be called repeatedly.
    pub fn collect_and_clear_domain_events(&mut self) -> Vec<RaisedEvent> {
        std::mem::take(&mut self.raised)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.raised.is_empty()
    }

    /// Give back the transaction (for commit or rollback).
    ///
    /// Events that were never collected are dropped.
    pub fn into_transaction(self) -> T {
        self.tx
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use maintops_core::AggregateRoot;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counted {
        value: u32,
        at: DateTime<Utc>,
    }

    impl Event for Counted {
        fn event_type(&self) -> &'static str {
            "test.counted"
        }

        fn event_types() -> &'static [&'static str] {
            &["test.counted"]
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        id: u32,
        value: u32,
        events: Vec<Counted>,
    }

    impl Counter {
        fn bump(&mut self) {
            self.value += 1;
            self.events.push(Counted {
                value: self.value,
                at: Utc::now(),
            });
        }
    }

    impl AggregateRoot for Counter {
        type Id = u32;

        fn id(&self) -> &u32 {
            &self.id
        }

        fn version(&self) -> u64 {
            u64::from(self.value)
        }
    }

    impl EventSource for Counter {
        type Event = Counted;

        fn pending_events(&self) -> &[Counted] {
            &self.events
        }

        fn take_events(&mut self) -> Vec<Counted> {
            std::mem::take(&mut self.events)
        }
    }

    #[test]
    fn register_drains_the_aggregate_buffer() {
        let mut uow = UnitOfWork::new(());
        let mut counter = Counter::default();
        counter.bump();
        counter.bump();

        uow.register(&mut counter);
        assert!(counter.pending_events().is_empty());

        let batch = uow.collect_and_clear_domain_events();
        let values: Vec<u32> = batch
            .iter()
            .filter_map(|e| e.downcast_ref::<Counted>())
            .map(|c| c.value)
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn collect_returns_empty_once_drained() {
        let mut uow = UnitOfWork::new(());
        uow.raise(Counted {
            value: 1,
            at: Utc::now(),
        });

        assert_eq!(uow.collect_and_clear_domain_events().len(), 1);
        assert!(uow.collect_and_clear_domain_events().is_empty());
        assert!(!uow.has_pending_events());
    }
}
