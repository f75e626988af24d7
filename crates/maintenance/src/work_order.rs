use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use maintops_core::{AggregateId, AggregateRoot, DomainError, DomainResult, EventSource};
use maintops_events::Event;

use crate::asset::AssetId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkOrderId(pub AggregateId);

impl WorkOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for WorkOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Open,
    Completed,
}

/// Aggregate root: WorkOrder.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrder {
    id: WorkOrderId,
    asset_id: AssetId,
    title: String,
    technician: Option<String>,
    status: WorkOrderStatus,
    version: u64,
    events: Vec<WorkOrderEvent>,
}

/// Event: WorkOrderOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderOpened {
    pub work_order_id: WorkOrderId,
    pub asset_id: AssetId,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: WorkOrderCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderCompleted {
    pub work_order_id: WorkOrderId,
    pub asset_id: AssetId,
    pub technician: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkOrderEvent {
    Opened(WorkOrderOpened),
    Completed(WorkOrderCompleted),
}

impl Event for WorkOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkOrderEvent::Opened(_) => "maintenance.work_order.opened",
            WorkOrderEvent::Completed(_) => "maintenance.work_order.completed",
        }
    }

    fn event_types() -> &'static [&'static str] {
        &[
            "maintenance.work_order.opened",
            "maintenance.work_order.completed",
        ]
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkOrderEvent::Opened(e) => e.occurred_at,
            WorkOrderEvent::Completed(e) => e.occurred_at,
        }
    }
}

impl WorkOrder {
    /// Open a new work order against an asset.
    pub fn open(
        id: WorkOrderId,
        asset_id: AssetId,
        title: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }

        Ok(Self {
            id,
            asset_id,
            title: title.clone(),
            technician: None,
            status: WorkOrderStatus::Open,
            version: 1,
            events: vec![WorkOrderEvent::Opened(WorkOrderOpened {
                work_order_id: id,
                asset_id,
                title,
                occurred_at,
            })],
        })
    }

    pub fn assign(&mut self, technician: impl Into<String>) -> DomainResult<()> {
        if self.status != WorkOrderStatus::Open {
            return Err(DomainError::conflict("work order is not open"));
        }
        let technician = technician.into();
        if technician.trim().is_empty() {
            return Err(DomainError::validation("technician cannot be empty"));
        }
        self.technician = Some(technician);
        self.version += 1;
        Ok(())
    }

    pub fn complete(&mut self, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != WorkOrderStatus::Open {
            return Err(DomainError::conflict("work order is not open"));
        }
        let technician = self
            .technician
            .clone()
            .ok_or_else(|| DomainError::invariant("work order has no technician"))?;

        self.status = WorkOrderStatus::Completed;
        self.version += 1;
        self.events.push(WorkOrderEvent::Completed(WorkOrderCompleted {
            work_order_id: self.id,
            asset_id: self.asset_id,
            technician,
            occurred_at,
        }));
        Ok(())
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn technician(&self) -> Option<&str> {
        self.technician.as_deref()
    }

    pub fn status(&self) -> WorkOrderStatus {
        self.status
    }
}

impl AggregateRoot for WorkOrder {
    type Id = WorkOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl EventSource for WorkOrder {
    type Event = WorkOrderEvent;

    fn pending_events(&self) -> &[WorkOrderEvent] {
        &self.events
    }

    fn take_events(&mut self) -> Vec<WorkOrderEvent> {
        std::mem::take(&mut self.events)
    }
}
