use std::collections::HashMap;
use std::sync::RwLock;

use facilityops_core::{AggregateId, ExpectedVersion, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, stream_version};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A batch must target exactly one stream and one aggregate type.
fn batch_key(events: &[UncommittedEvent]) -> Result<(StreamKey, &str), EventStoreError> {
    let first = &events[0];
    for (idx, e) in events.iter().enumerate().skip(1) {
        if e.tenant_id != first.tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch contains multiple tenant_ids (index {idx})"
            )));
        }
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    let key = StreamKey {
        tenant_id: first.tenant_id,
        aggregate_id: first.aggregate_id,
    };
    Ok((key, first.aggregate_type.as_str()))
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let (key, aggregate_type) = batch_key(&events)?;
        let aggregate_type = aggregate_type.to_string();

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams.entry(key).or_default();
        let current = stream_version(stream);

        expected_version
            .check(current)
            .map_err(|e| EventStoreError::Concurrency(e.to_string()))?;

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{aggregate_type}'",
                    existing.aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                tenant_id: e.tenant_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();

        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }
}
