use facilityops_core::AggregateId;

/// A command targets exactly one aggregate instance.
///
/// Commands are intent ("record a count of 25"); the events they produce are
/// the facts that get persisted. Routing, locking and optimistic concurrency
/// all key off `target_aggregate_id`.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
