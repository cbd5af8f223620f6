//! Append-only event store boundary.
//!
//! Count sessions are persisted as event streams; this module defines the
//! storage abstraction and an in-memory implementation.

pub mod in_memory;
pub mod r#trait;

use serde_json::Value as JsonValue;

use facilityops_core::{AggregateId, ExpectedVersion, TenantId};
use facilityops_events::{EventBus, EventEnvelope};

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, stream_version};

/// Store decorator that publishes committed events to an `EventBus`.
///
/// Publication happens only after the append succeeded. A publish failure is
/// returned to the caller, but the events stay committed (at-least-once).
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
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
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(tenant_id, aggregate_id)
    }
}
