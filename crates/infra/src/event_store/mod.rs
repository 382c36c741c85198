//! Append-only event store boundary.
//!
//! One stream per aggregate (stock item or order), keyed by `AggregateId`.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

use atelier_core::{AggregateId, ExpectedVersion};
use atelier_events::{EventBus, EventEnvelope};
use serde_json::Value as JsonValue;

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Publication happens only after the append committed. A publish failure is
/// logged and does not fail the append: the events are durable and
/// subscribers can catch up from the store.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version)?;

        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                tracing::warn!(
                    event_id = %e.event_id,
                    event_type = %e.event_type,
                    error = ?err,
                    "failed to publish committed event"
                );
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(aggregate_id)
    }

    fn load_by_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_by_type(aggregate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_events::InMemoryEventBus;
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn publishes_only_committed_events() {
        let bus = Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new());
        let sub = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());
        let id = AggregateId::new();
        let event = || UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id: id,
            aggregate_type: "order".to_string(),
            event_type: "orders.order.placed".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": 1 }),
        };

        store.append(vec![event()], ExpectedVersion::Exact(0)).unwrap();
        assert!(store.append(vec![event()], ExpectedVersion::Exact(0)).is_err());

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].sequence_number(), 1);
        assert_eq!(published[0].event_type(), "orders.order.placed");
    }
}
