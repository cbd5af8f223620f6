//! Inventory cycle-count domain (event-sourced).
//!
//! This crate contains the business rules for reconciling physical counts
//! against system stock, implemented purely as deterministic domain logic
//! (no IO, no storage). Applying adjustments to the catalog lives in
//! `facilityops-infra`.

pub mod approval;
pub mod error;
pub mod item;
pub mod ledger;
pub mod material;
pub mod selector;
pub mod session;
pub mod session_number;
pub mod variance;

pub use approval::{ApprovalGate, ApprovalReport, REASON_REQUIRED_ABOVE_PERCENT};
pub use error::CountError;
pub use item::{CountItem, ReasonCode};
pub use ledger::{LedgerEntry, PostingLine, PostingSummary, posting_set};
pub use material::{Material, MaterialId, MaterialSnapshot};
pub use selector::{ItemSelector, MaterialQuery, ScopeFilter};
pub use session::{
    AbortPosting, ApprovalSet, ApproveAllVariances, BeginPosting, Cancel, CountProgress,
    CountRecorded, CountSession, CountSessionCommand, CountSessionEvent, CountSessionId,
    CountSessionStatus, CountingStarted, MarkPosted, NotesSet, OpenSession, PostingAborted,
    PostingStarted, ReasonCodeSet, RecordCount, ReturnToCounting, ReturnedToCounting,
    ReviewStarted, SelectItems, SessionCancelled, SessionOpened, SessionPosted, SessionSummary,
    SetApproval, SetNotes, SetReasonCode, SubmitForReview, VariancesApproved,
};
pub use session_number::SessionNumber;
pub use variance::{MINOR_VARIANCE_PERCENT, VarianceClass, VarianceOutcome, compute_variance};
