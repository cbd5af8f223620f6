//! `facilityops-core`: domain building blocks shared by the facility-operations crates.
//!
//! Pure domain primitives only: no IO, no storage, no logging.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId};
pub use value_object::ValueObject;
