//! Entity trait: identity that survives state changes.

/// An object identified by its id rather than its attributes.
///
/// Entities live inside an aggregate (a count line inside a count session)
/// and are only mutated through their aggregate root.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
