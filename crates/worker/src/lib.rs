//! `maintops-worker` — operator entry point for outbox delivery.
//!
//! A [`WorkerGroup`] owns a fixed number of worker slots. Each slot runs one
//! [`OutboxWorker`] loop on its own tokio task and can be started or stopped
//! independently. Workers share nothing but the store; claiming with
//! lock-skip is what keeps them from delivering the same message twice.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use maintops_events::{HandlerRegistry, RegistryError};
use maintops_infra::outbox::OutboxStore;
use maintops_infra::{OutboxConfig, OutboxWorker, WorkerState, WorkerStats};
use maintops_maintenance::{AssetEvent, MaintenanceNotifier, NotificationSink, WorkOrderEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("worker slot {index} does not exist (group has {count})")]
    UnknownWorker { index: usize, count: usize },

    #[error("worker slot {0} is already running")]
    AlreadyRunning(usize),
}

/// A running worker: its shutdown switch and task.
pub struct WorkerHandle<S: OutboxStore> {
    worker: Arc<OutboxWorker<S>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl<S: OutboxStore> WorkerHandle<S> {
    fn request_stop(&self) {
        // Err only means the task already exited.
        let _ = self.shutdown.send(true);
    }

    /// Lifecycle updates of this worker.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.worker.subscribe_state()
    }
}

impl<S: OutboxStore + 'static> WorkerHandle<S> {
    fn spawn(worker: OutboxWorker<S>) -> Self {
        let worker = Arc::new(worker);
        let (shutdown, signal) = watch::channel(false);
        let join = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(signal).await }
        });
        Self {
            worker,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    async fn join(self) -> WorkerStats {
        let name = self.worker.name().to_string();
        if let Err(err) = self.join.await {
            warn!(worker = %name, error = %err, "outbox worker task ended abnormally");
        }
        self.worker.stats()
    }

    /// Request graceful shutdown and wait for the in-flight message to finish.
    pub async fn shutdown(self) -> WorkerStats {
        self.request_stop();
        self.join().await
    }
}

/// `worker_count` independently controllable outbox workers.
///
/// Dropping the group signals every running worker to stop after its
/// in-flight message; use [`shutdown`](WorkerGroup::shutdown) to also wait
/// for them.
pub struct WorkerGroup<S: OutboxStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry<S::Tx>>,
    config: OutboxConfig,
    slots: Vec<Option<WorkerHandle<S>>>,
}

impl<S: OutboxStore + 'static> WorkerGroup<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry<S::Tx>>, config: OutboxConfig) -> Self {
        let slots = (0..config.worker_count).map(|_| None).collect();
        Self {
            store,
            registry,
            config,
            slots,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_running(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    pub fn handle(&self, index: usize) -> Option<&WorkerHandle<S>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn slot(&mut self, index: usize) -> Result<&mut Option<WorkerHandle<S>>, GroupError> {
        let count = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(GroupError::UnknownWorker { index, count })
    }

    /// Start the worker in slot `index`. Must be called inside a tokio runtime.
    pub fn start(&mut self, index: usize) -> Result<(), GroupError> {
        if self.slot(index)?.is_some() {
            return Err(GroupError::AlreadyRunning(index));
        }
        let worker = OutboxWorker::from_config(
            format!("outbox-worker-{index}"),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            &self.config,
        );
        *self.slot(index)? = Some(WorkerHandle::spawn(worker));
        info!(worker = index, "outbox worker slot started");
        Ok(())
    }

    /// Start every slot that is not running. Returns how many were started.
    pub fn start_all(&mut self) -> usize {
        let mut started = 0;
        for index in 0..self.slots.len() {
            if !self.is_running(index) && self.start(index).is_ok() {
                started += 1;
            }
        }
        started
    }

    /// Stop the worker in slot `index`. `None` if it was not running.
    pub async fn stop(&mut self, index: usize) -> Result<Option<WorkerStats>, GroupError> {
        let Some(handle) = self.slot(index)?.take() else {
            return Ok(None);
        };
        let stats = handle.shutdown().await;
        info!(worker = index, processed = stats.messages_processed, "outbox worker slot stopped");
        Ok(Some(stats))
    }

    /// Signal every running worker, then wait for all of them.
    pub async fn shutdown(&mut self) {
        let handles: Vec<WorkerHandle<S>> = self.slots.iter_mut().filter_map(Option::take).collect();
        for handle in &handles {
            handle.request_stop();
        }
        for handle in handles {
            handle.join().await;
        }
        info!("outbox worker group stopped");
    }
}

impl<S: OutboxStore> Drop for WorkerGroup<S> {
    fn drop(&mut self) {
        for handle in self.slots.iter().flatten() {
            handle.request_stop();
        }
    }
}

/// Deferred handlers of the maintenance module.
pub fn maintenance_registry<T, N>(
    notifier: MaintenanceNotifier<N>,
) -> Result<HandlerRegistry<T>, RegistryError>
where
    T: Send + 'static,
    N: NotificationSink + 'static,
{
    let mut registry = HandlerRegistry::<T>::new();
    registry
        .on_deferred::<WorkOrderEvent, _>(notifier.clone())?
        .on_deferred::<AssetEvent, _>(notifier)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use maintops_events::{DeferredHandler, Event, HandlerError};
    use maintops_infra::outbox::{InMemoryOutboxStore, InMemoryTx, OutboxAdmin, QueuedMessage};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct MeterRead {
        value: u32,
        at: DateTime<Utc>,
    }

    impl Event for MeterRead {
        fn event_type(&self) -> &'static str {
            "test.meter_read"
        }

        fn event_types() -> &'static [&'static str] {
            &["test.meter_read"]
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<u32>>>);

    #[async_trait]
    impl DeferredHandler<MeterRead, InMemoryTx> for Seen {
        async fn handle(&self, event: &MeterRead, _tx: &mut InMemoryTx) -> Result<(), HandlerError> {
            self.0.lock().unwrap().push(event.value);
            Ok(())
        }
    }

    fn group(workers: usize) -> (Arc<InMemoryOutboxStore>, Seen, WorkerGroup<InMemoryOutboxStore>) {
        let store = InMemoryOutboxStore::arc();
        let seen = Seen::default();
        let mut registry: HandlerRegistry<InMemoryTx> = HandlerRegistry::new();
        registry.on_deferred::<MeterRead, _>(seen.clone()).unwrap();
        let config = OutboxConfig::default()
            .with_worker_count(workers)
            .with_poll_interval(Duration::from_millis(10))
            .with_batch_size(4);
        let group = WorkerGroup::new(Arc::clone(&store), Arc::new(registry), config);
        (store, seen, group)
    }

    async fn enqueue(store: &InMemoryOutboxStore, count: u32) {
        let mut tx = store.begin().await.unwrap();
        for value in 0..count {
            let event = MeterRead {
                value,
                at: Utc::now(),
            };
            let payload = serde_json::to_value(&event).unwrap();
            store
                .add(&mut tx, &QueuedMessage::new("test.meter_read", payload))
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    async fn wait_for_processed(store: &InMemoryOutboxStore, expected: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.stats().await.unwrap().processed < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("workers did not drain the queue in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_drains_the_queue_once() {
        let (store, seen, mut group) = group(3);
        assert_eq!(group.start_all(), 3);
        assert_eq!(group.running_count(), 3);

        enqueue(&store, 25).await;
        wait_for_processed(&store, 25).await;
        group.shutdown().await;

        let mut values = seen.0.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, (0..25).collect::<Vec<_>>());
        assert_eq!(group.running_count(), 0);
    }

    #[tokio::test]
    async fn workers_start_and_stop_independently() {
        let (store, _seen, mut group) = group(2);
        group.start(1).unwrap();
        assert!(!group.is_running(0));
        assert!(group.is_running(1));
        assert_eq!(group.handle(1).unwrap().name(), "outbox-worker-1");
        assert_eq!(group.start(1), Err(GroupError::AlreadyRunning(1)));

        enqueue(&store, 3).await;
        wait_for_processed(&store, 3).await;

        let stats = group.stop(1).await.unwrap().unwrap();
        assert_eq!(stats.messages_processed, 3);
        assert!(!group.is_running(1));
        assert!(group.stop(1).await.unwrap().is_none());

        group.start(0).unwrap();
        enqueue(&store, 2).await;
        wait_for_processed(&store, 5).await;
        group.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_slots_are_rejected() {
        let (_store, _seen, mut group) = group(2);
        assert_eq!(
            group.start(2),
            Err(GroupError::UnknownWorker { index: 2, count: 2 })
        );
        assert!(group.stop(5).await.is_err());
    }

    #[tokio::test]
    async fn dropping_the_group_stops_its_workers() {
        let (_store, _seen, mut group) = group(1);
        group.start(0).unwrap();
        let mut state = group.handle(0).unwrap().subscribe_state();
        drop(group);

        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != WorkerState::Stopped {
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("worker kept running after its group was dropped");
        assert_eq!(*state.borrow(), WorkerState::Stopped);
    }

    #[test]
    fn maintenance_registry_routes_every_maintenance_event() {
        let registry: HandlerRegistry<()> =
            maintenance_registry(MaintenanceNotifier::new(maintops_maintenance::TracingSink)).unwrap();
        for tag in WorkOrderEvent::event_types()
            .iter()
            .chain(AssetEvent::event_types())
        {
            assert_eq!(registry.handler_counts(tag), (0, 1), "{tag}");
        }
    }
}
