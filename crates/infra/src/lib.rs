//! Infrastructure layer: storage boundaries, the posting engine, and the
//! cycle-count application service.

pub mod catalog;
pub mod config;
pub mod cycle_count;
pub mod event_store;
pub mod ledger_store;
pub mod posting;
pub mod session_store;


pub use catalog::{
    AppliedAdjustment, CatalogError, InMemoryMaterialCatalog, MaterialCatalog, OnHandAdjustment,
};
pub use config::{CycleCountConfig, PostingConfig};
pub use cycle_count::{CycleCountError, CycleCountService, ErrorKind};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PublishingEventStore};
pub use ledger_store::{InMemoryLedgerStore, LedgerError, LedgerStore};
pub use posting::{PostingEngine, PostingError, PostingReceipt};
pub use session_store::{EventSourcedSessionStore, SessionStore, SessionStoreError};
