//! Value object trait: equality by value, not identity.

/// Marker for immutable values compared by their attributes.
///
/// Examples in this workspace: a computed variance, a session number, a
/// posting summary. To "change" one, build a new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
