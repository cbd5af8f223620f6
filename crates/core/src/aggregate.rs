//! Aggregate root traits for event-sourced domain models.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
///
/// Kept small on purpose: each domain crate decides how its state transitions
/// are modelled, and none of them pull infrastructure in through this trait.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events applied to this instance (the stream revision).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a versioned resource.
///
/// Used both for aggregate streams and for compare-and-swap writes against
/// shared records such as a material's on-hand quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip version checking (compensating writes, migrations).
    Any,
    /// Require the resource to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - `handle(&self, cmd)` decides which events a command produces.
/// - `apply(&mut self, event)` evolves state from one event.
///
/// Neither method may perform IO.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event (+1 version per event).
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}
