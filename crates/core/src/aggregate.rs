//! Aggregate root traits for state-based domain models that raise events.

/// Aggregate root marker + minimal interface.
///
/// Kept small so domain modules decide how they model state transitions
/// without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented once per accepted state change.
    fn version(&self) -> u64;
}

/// An aggregate that buffers the domain events raised by its state changes.
///
/// Aggregates push events into an internal buffer while handling business
/// operations. The unit of work drains that buffer when the aggregate is
/// registered with it, so every raised event is seen exactly once.
pub trait EventSource: AggregateRoot {
    type Event: Clone + core::fmt::Debug;

    /// Events raised since the last call, in the order they were raised.
    fn pending_events(&self) -> &[Self::Event];

    /// Drain the buffer, leaving it empty.
    fn take_events(&mut self) -> Vec<Self::Event>;
}
