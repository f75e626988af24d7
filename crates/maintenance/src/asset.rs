use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use maintops_core::{AggregateId, AggregateRoot, DomainError, DomainResult, EventSource};
use maintops_events::Event;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub AggregateId);

impl AssetId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AssetId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Asset (a maintained piece of equipment).
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    id: AssetId,
    name: String,
    service_count: u32,
    last_serviced_at: Option<DateTime<Utc>>,
    version: u64,
    events: Vec<AssetEvent>,
}

/// Event: AssetServiced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetServiced {
    pub asset_id: AssetId,
    pub service_count: u32,
    pub note: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetEvent {
    Serviced(AssetServiced),
}

impl Event for AssetEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AssetEvent::Serviced(_) => "maintenance.asset.serviced",
        }
    }

    fn event_types() -> &'static [&'static str] {
        &["maintenance.asset.serviced"]
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AssetEvent::Serviced(e) => e.occurred_at,
        }
    }
}

impl Asset {
    pub fn register(id: AssetId, name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("asset name cannot be empty"));
        }

        Ok(Self {
            id,
            name,
            service_count: 0,
            last_serviced_at: None,
            version: 1,
            events: Vec::new(),
        })
    }

    /// Record a completed service visit.
    ///
    /// Visits must not go back in time.
    pub fn record_service(
        &mut self,
        note: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if let Some(last) = self.last_serviced_at {
            if occurred_at < last {
                return Err(DomainError::invariant(
                    "service date precedes the previous service",
                ));
            }
        }

        self.service_count += 1;
        self.last_serviced_at = Some(occurred_at);
        self.version += 1;
        self.events.push(AssetEvent::Serviced(AssetServiced {
            asset_id: self.id,
            service_count: self.service_count,
            note: note.into(),
            occurred_at,
        }));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_count(&self) -> u32 {
        self.service_count
    }

    pub fn last_serviced_at(&self) -> Option<DateTime<Utc>> {
        self.last_serviced_at
    }
}

impl AggregateRoot for Asset {
    type Id = AssetId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl EventSource for Asset {
    type Event = AssetEvent;

    fn pending_events(&self) -> &[AssetEvent] {
        &self.events
    }

    fn take_events(&mut self) -> Vec<AssetEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn pump() -> Asset {
        Asset::register(AssetId::new(AggregateId::new()), "Pump 7").unwrap()
    }

    #[test]
    fn servicing_backwards_in_time_is_rejected() {
        let mut asset = pump();
        let now = Utc::now();
        asset.record_service("oil change", now).unwrap();

        let err = asset
            .record_service("late entry", now - Duration::hours(1))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(asset.service_count(), 1);
    }

    #[test]
    fn serviced_event_survives_json() {
        let mut asset = pump();
        asset.record_service("belt", Utc::now()).unwrap();
        let event = asset.take_events().remove(0);

        let json = serde_json::to_value(&event).unwrap();
        let back: AssetEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    proptest! {
        #[test]
        fn service_count_matches_raised_events(offsets in proptest::collection::vec(0i64..10_000, 1..20)) {
            let mut asset = pump();
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut minutes = 0i64;
            for offset in &offsets {
                minutes += offset;
                asset.record_service("visit", base + Duration::minutes(minutes)).unwrap();
            }

            let events = asset.take_events();
            prop_assert_eq!(events.len(), offsets.len());
            prop_assert_eq!(asset.service_count() as usize, offsets.len());
            for (idx, AssetEvent::Serviced(e)) in events.iter().enumerate() {
                prop_assert_eq!(e.service_count as usize, idx + 1);
            }
        }
    }
}
