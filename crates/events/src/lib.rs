//! Event and command mechanics shared by the domain and infrastructure crates.
//!
//! Domain-agnostic: no crate here knows about count sessions or materials.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
