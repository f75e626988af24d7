//! Deferred consumers for maintenance events.
//!
//! These run in outbox workers, never inside the business transaction.

use std::sync::Arc;

use async_trait::async_trait;

use maintops_events::{DeferredHandler, HandlerError};

use crate::asset::AssetEvent;
use crate::work_order::WorkOrderEvent;

/// Something worth telling a human about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: &'static str,
    pub subject: String,
    pub body: String,
}

/// Delivery channel for notifications (mail, chat, pager...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> Result<(), HandlerError>;
}

/// Sink that only writes a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: Notification) -> Result<(), HandlerError> {
        tracing::info!(
            topic = notification.topic,
            subject = %notification.subject,
            "notification delivered"
        );
        Ok(())
    }
}

/// Turns work-order and asset events into notifications.
///
/// Generic over the transaction handle; it never writes to the database.
pub struct MaintenanceNotifier<S> {
    sink: Arc<S>,
}

impl<S> Clone for MaintenanceNotifier<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<S: NotificationSink> MaintenanceNotifier<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[async_trait]
impl<S, T> DeferredHandler<WorkOrderEvent, T> for MaintenanceNotifier<S>
where
    S: NotificationSink + 'static,
    T: Send + 'static,
{
    async fn handle(&self, event: &WorkOrderEvent, _tx: &mut T) -> Result<(), HandlerError> {
        let notification = match event {
            WorkOrderEvent::Opened(e) => Notification {
                topic: "work_order.opened",
                subject: format!("Work order {} opened", e.work_order_id),
                body: e.title.clone(),
            },
            WorkOrderEvent::Completed(e) => Notification {
                topic: "work_order.completed",
                subject: format!("Work order {} completed", e.work_order_id),
                body: format!("completed by {}", e.technician),
            },
        };
        self.sink.deliver(notification).await
    }
}

#[async_trait]
impl<S, T> DeferredHandler<AssetEvent, T> for MaintenanceNotifier<S>
where
    S: NotificationSink + 'static,
    T: Send + 'static,
{
    async fn handle(&self, event: &AssetEvent, _tx: &mut T) -> Result<(), HandlerError> {
        let AssetEvent::Serviced(e) = event;
        self.sink
            .deliver(Notification {
                topic: "asset.serviced",
                subject: format!("Asset {} serviced (visit #{})", e.asset_id, e.service_count),
                body: e.note.clone(),
            })
            .await
    }
}
