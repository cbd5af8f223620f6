//! Durable storage for count sessions.
//!
//! Sessions are event-sourced: `create` and `update` append the events a
//! command produced, `get` rehydrates the aggregate from its stream.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use facilityops_core::{Aggregate, AggregateId, ExpectedVersion, TenantId};
use facilityops_inventory::{CountSession, CountSessionEvent, CountSessionId};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Stream aggregate type for count sessions.
pub const COUNT_SESSION_AGGREGATE: &str = "inventory.count_session";

#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// Someone else wrote to the session since it was loaded.
    #[error("count session was modified concurrently: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("failed to deserialize session event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),
}

impl From<EventStoreError> for SessionStoreError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => SessionStoreError::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => SessionStoreError::TenantIsolation(msg),
            other => SessionStoreError::Store(other),
        }
    }
}

/// Session persistence boundary.
///
/// `update` carries only the new events (the changed fields) together with
/// the version they were decided against.
pub trait SessionStore: Send + Sync {
    /// Allocate an identifier for a new session.
    fn next_id(&self) -> CountSessionId;

    /// Persist the opening events of a new session. Returns the new version.
    fn create(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError>;

    /// Append events decided against `expected_version`. Returns the new version.
    fn update(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        expected_version: u64,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError>;

    fn get(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Option<CountSession>, SessionStoreError>;
}

impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    fn next_id(&self) -> CountSessionId {
        (**self).next_id()
    }

    fn create(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError> {
        (**self).create(tenant_id, session_id, events)
    }

    fn update(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        expected_version: u64,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError> {
        (**self).update(tenant_id, session_id, expected_version, events)
    }

    fn get(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Option<CountSession>, SessionStoreError> {
        (**self).get(tenant_id, session_id)
    }
}

/// `SessionStore` over any `EventStore` (in-memory, publishing, ...).
#[derive(Debug)]
pub struct EventSourcedSessionStore<S> {
    store: S,
}

impl<S> EventSourcedSessionStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> EventSourcedSessionStore<S> {
    fn append(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        expected: ExpectedVersion,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError> {
        if events.is_empty() {
            return Err(SessionStoreError::Store(EventStoreError::InvalidAppend(
                "no events to append".to_string(),
            )));
        }

        let uncommitted = events
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    session_id.0,
                    COUNT_SESSION_AGGREGATE,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;
        committed.last().map(|e| e.sequence_number).ok_or_else(|| {
            SessionStoreError::Store(EventStoreError::InvalidAppend(
                "store committed no events".to_string(),
            ))
        })
    }
}

impl<S: EventStore> SessionStore for EventSourcedSessionStore<S> {
    fn next_id(&self) -> CountSessionId {
        CountSessionId::new(AggregateId::new())
    }

    fn create(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError> {
        self.append(tenant_id, session_id, ExpectedVersion::Exact(0), events)
    }

    fn update(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        expected_version: u64,
        events: &[CountSessionEvent],
    ) -> Result<u64, SessionStoreError> {
        self.append(
            tenant_id,
            session_id,
            ExpectedVersion::Exact(expected_version),
            events,
        )
    }

    fn get(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Option<CountSession>, SessionStoreError> {
        let history = self.store.load_stream(tenant_id, session_id.0)?;
        if history.is_empty() {
            return Ok(None);
        }
        validate_loaded_stream(tenant_id, session_id.0, &history)?;

        let mut session = CountSession::empty(session_id);
        apply_history(&mut session, &history)?;
        Ok(Some(session))
    }
}

/// Reject cross-tenant or out-of-order streams even if a backend returns them.
fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), SessionStoreError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(SessionStoreError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(SessionStoreError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(SessionStoreError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history(
    session: &mut CountSession,
    history: &[StoredEvent],
) -> Result<(), SessionStoreError> {
    for stored in history {
        let ev: CountSessionEvent = serde_json::from_value(stored.payload.clone())
            .map_err(|e| SessionStoreError::Deserialize(e.to_string()))?;
        session.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use facilityops_core::AggregateRoot;
    use facilityops_inventory::{
        CountSessionStatus, ScopeFilter, SessionCancelled, SessionNumber, SessionOpened,
    };

    use crate::event_store::InMemoryEventStore;

    fn opened(tenant_id: TenantId, session_id: CountSessionId) -> CountSessionEvent {
        CountSessionEvent::SessionOpened(SessionOpened {
            tenant_id,
            session_id,
            session_number: SessionNumber::from_parts(
                NaiveDate::from_ymd_opt(2024, 1, 9).unwrap(),
                7,
            ),
            name: "Boiler room".to_string(),
            scope: ScopeFilter::Location("B1".to_string()),
            created_by: "alex".to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn cancelled(tenant_id: TenantId, session_id: CountSessionId) -> CountSessionEvent {
        CountSessionEvent::SessionCancelled(SessionCancelled {
            tenant_id,
            session_id,
            cancelled_by: "alex".to_string(),
            reason: None,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn create_then_get_rehydrates_session() {
        let store = EventSourcedSessionStore::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let id = store.next_id();

        assert_eq!(store.create(tenant, id, &[opened(tenant, id)]).unwrap(), 1);

        let session = store.get(tenant, id).unwrap().unwrap();
        assert_eq!(session.name(), "Boiler room");
        assert_eq!(session.status(), CountSessionStatus::Draft);
        assert_eq!(session.version(), 1);
    }

    #[test]
    fn update_with_stale_version_is_a_concurrency_error() {
        let store = EventSourcedSessionStore::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let id = store.next_id();
        store.create(tenant, id, &[opened(tenant, id)]).unwrap();

        assert_eq!(store.update(tenant, id, 1, &[cancelled(tenant, id)]).unwrap(), 2);
        let err = store.update(tenant, id, 1, &[cancelled(tenant, id)]).unwrap_err();
        assert!(matches!(err, SessionStoreError::Concurrency(_)));
    }

    #[test]
    fn creating_an_existing_session_conflicts() {
        let store = EventSourcedSessionStore::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let id = store.next_id();
        store.create(tenant, id, &[opened(tenant, id)]).unwrap();

        assert!(matches!(
            store.create(tenant, id, &[opened(tenant, id)]),
            Err(SessionStoreError::Concurrency(_))
        ));
    }

    #[test]
    fn sessions_are_invisible_to_other_tenants() {
        let store = EventSourcedSessionStore::new(InMemoryEventStore::new());
        let tenant = TenantId::new();
        let id = store.next_id();
        store.create(tenant, id, &[opened(tenant, id)]).unwrap();

        assert!(store.get(TenantId::new(), id).unwrap().is_none());
    }
}
