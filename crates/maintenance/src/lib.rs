//! Maintenance domain module (work orders and assets).
//!
//! Deliberately thin: just enough state and events to drive the outbox
//! end-to-end. Aggregates buffer the events they raise; nothing here does IO.

pub mod asset;
pub mod notify;
pub mod work_order;

pub use asset::{Asset, AssetEvent, AssetId, AssetServiced};
pub use notify::{MaintenanceNotifier, Notification, NotificationSink, TracingSink};
pub use work_order::{
    WorkOrder, WorkOrderCompleted, WorkOrderEvent, WorkOrderId, WorkOrderOpened, WorkOrderStatus,
};
