use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use facilityops_core::{Aggregate, AggregateId, AggregateRoot, TenantId};
use facilityops_events::{Command, Event};

use crate::approval::{ApprovalGate, ApprovalReport};
use crate::error::CountError;
use crate::item::{CountItem, ReasonCode};
use crate::ledger::{PostingLine, PostingSummary, posting_set};
use crate::material::{MaterialId, MaterialSnapshot};
use crate::selector::ScopeFilter;
use crate::session_number::SessionNumber;
use crate::variance::VarianceClass;

/// Count session identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountSessionId(pub AggregateId);

impl CountSessionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CountSessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Count session lifecycle.
///
/// `Draft → Counting → Review → Posted`, with `Review → Counting` allowed and
/// `Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountSessionStatus {
    Draft,
    Counting,
    Review,
    Posted,
    Cancelled,
}

impl CountSessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CountSessionStatus::Posted | CountSessionStatus::Cancelled)
    }
}

/// Counted vs. total lines.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountProgress {
    pub counted: usize,
    pub total: usize,
}

impl CountProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.counted == self.total
    }

    /// Whole-percent completion (0 for an empty session).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.counted * 100) / self.total) as u8
    }
}

/// Review-screen roll-up of a session's lines.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_items: usize,
    pub counted_items: usize,
    pub matches: usize,
    pub minor_variances: usize,
    pub significant_variances: usize,
    pub pending_approval: usize,
    pub missing_reasons: usize,
}

/// Aggregate root: CountSession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountSession {
    id: CountSessionId,
    tenant_id: Option<TenantId>,
    session_number: Option<SessionNumber>,
    name: String,
    scope: ScopeFilter,
    created_by: String,
    status: CountSessionStatus,
    items: Vec<CountItem>,
    created_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    posting_started_at: Option<DateTime<Utc>>,
    posting_summary: Option<PostingSummary>,
    version: u64,
    created: bool,
}

impl CountSession {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: CountSessionId) -> Self {
        Self {
            id,
            tenant_id: None,
            session_number: None,
            name: String::new(),
            scope: ScopeFilter::All,
            created_by: String::new(),
            status: CountSessionStatus::Draft,
            items: Vec::new(),
            created_at: None,
            completed_at: None,
            cancelled_at: None,
            posting_started_at: None,
            posting_summary: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CountSessionId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn session_number(&self) -> Option<&SessionNumber> {
        self.session_number.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &ScopeFilter {
        &self.scope
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn status(&self) -> CountSessionStatus {
        self.status
    }

    pub fn items(&self) -> &[CountItem] {
        &self.items
    }

    pub fn item(&self, material_id: MaterialId) -> Option<&CountItem> {
        self.items.iter().find(|i| i.material_id == material_id)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    /// Totals recorded when the session was posted.
    pub fn posting_summary(&self) -> Option<&PostingSummary> {
        self.posting_summary.as_ref()
    }

    /// When the current posting attempt reserved the session, if one did.
    pub fn posting_started_at(&self) -> Option<DateTime<Utc>> {
        self.posting_started_at
    }

    /// Reserved for posting: everything but finalizing or aborting is rejected.
    pub fn is_posting(&self) -> bool {
        self.posting_started_at.is_some()
    }

    pub fn progress(&self) -> CountProgress {
        CountProgress {
            counted: self.items.iter().filter(|i| i.is_counted()).count(),
            total: self.items.len(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total_items: self.items.len(),
            ..SessionSummary::default()
        };
        for item in self.items.iter().filter(|i| i.is_counted()) {
            summary.counted_items += 1;
            match item.class() {
                VarianceClass::Match => summary.matches += 1,
                VarianceClass::Minor => summary.minor_variances += 1,
                VarianceClass::Significant => summary.significant_variances += 1,
            }
        }
        let report = self.approval_report();
        summary.pending_approval = report.unapproved.len();
        summary.missing_reasons = report.missing_reasons.len();
        summary
    }

    pub fn approval_report(&self) -> ApprovalReport {
        ApprovalGate::report(&self.items)
    }

    /// Run the approval gate. Side-effect free; safe to call repeatedly.
    pub fn check_approval(&self) -> Result<(), CountError> {
        ApprovalGate::evaluate(&self.items)
    }

    /// Lines that posting would adjust.
    pub fn posting_set(&self) -> Vec<PostingLine> {
        posting_set(&self.items)
    }
}

impl AggregateRoot for CountSession {
    type Id = CountSessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenSession (creates the session in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub session_number: SessionNumber,
    pub name: String,
    pub scope: ScopeFilter,
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SelectItems (Draft → Counting).
///
/// Carries catalog snapshots read by the caller at this instant; they become
/// the lines' system quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectItems {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub materials: Vec<MaterialSnapshot>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordCount (`None` clears a previously entered count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCount {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub counted_quantity: Option<i64>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetReasonCode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReasonCode {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub reason_code: Option<ReasonCode>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetNotes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNotes {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub notes: String,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetApproval (approve or un-approve one line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetApproval {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub approved: bool,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveAllVariances (one batch over the variance set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveAllVariances {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitForReview (Counting → Review).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitForReview {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReturnToCounting (Review → Counting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnToCounting {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: BeginPosting (reserve a reviewed session for the posting engine).
///
/// Runs the approval gate. Until the session is posted or the attempt is
/// aborted, counts, approvals, reasons, notes and the status are frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginPosting {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub posted_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AbortPosting (release a reservation whose posting applied nothing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortPosting {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkPosted (Review → Posted).
///
/// Issued only after the posting engine has applied the adjustments; the
/// summary is what it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPosted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub posted_by: String,
    pub summary: PostingSummary,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel (any non-terminal state → Cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub cancelled_by: String,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountSessionCommand {
    OpenSession(OpenSession),
    SelectItems(SelectItems),
    RecordCount(RecordCount),
    SetReasonCode(SetReasonCode),
    SetNotes(SetNotes),
    SetApproval(SetApproval),
    ApproveAllVariances(ApproveAllVariances),
    SubmitForReview(SubmitForReview),
    ReturnToCounting(ReturnToCounting),
    BeginPosting(BeginPosting),
    AbortPosting(AbortPosting),
    MarkPosted(MarkPosted),
    Cancel(Cancel),
}

impl CountSessionCommand {
    pub fn session_id(&self) -> CountSessionId {
        match self {
            CountSessionCommand::OpenSession(c) => c.session_id,
            CountSessionCommand::SelectItems(c) => c.session_id,
            CountSessionCommand::RecordCount(c) => c.session_id,
            CountSessionCommand::SetReasonCode(c) => c.session_id,
            CountSessionCommand::SetNotes(c) => c.session_id,
            CountSessionCommand::SetApproval(c) => c.session_id,
            CountSessionCommand::ApproveAllVariances(c) => c.session_id,
            CountSessionCommand::SubmitForReview(c) => c.session_id,
            CountSessionCommand::ReturnToCounting(c) => c.session_id,
            CountSessionCommand::BeginPosting(c) => c.session_id,
            CountSessionCommand::AbortPosting(c) => c.session_id,
            CountSessionCommand::MarkPosted(c) => c.session_id,
            CountSessionCommand::Cancel(c) => c.session_id,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        match self {
            CountSessionCommand::OpenSession(c) => c.tenant_id,
            CountSessionCommand::SelectItems(c) => c.tenant_id,
            CountSessionCommand::RecordCount(c) => c.tenant_id,
            CountSessionCommand::SetReasonCode(c) => c.tenant_id,
            CountSessionCommand::SetNotes(c) => c.tenant_id,
            CountSessionCommand::SetApproval(c) => c.tenant_id,
            CountSessionCommand::ApproveAllVariances(c) => c.tenant_id,
            CountSessionCommand::SubmitForReview(c) => c.tenant_id,
            CountSessionCommand::ReturnToCounting(c) => c.tenant_id,
            CountSessionCommand::BeginPosting(c) => c.tenant_id,
            CountSessionCommand::AbortPosting(c) => c.tenant_id,
            CountSessionCommand::MarkPosted(c) => c.tenant_id,
            CountSessionCommand::Cancel(c) => c.tenant_id,
        }
    }
}

impl Command for CountSessionCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.session_id().0
    }
}

/// Event: SessionOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpened {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub session_number: SessionNumber,
    pub name: String,
    pub scope: ScopeFilter,
    pub created_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountingStarted (count lines materialized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingStarted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub materials: Vec<MaterialSnapshot>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecorded {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub counted_quantity: Option<i64>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReasonCodeSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonCodeSet {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub reason_code: Option<ReasonCode>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: NotesSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesSet {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub notes: String,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ApprovalSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSet {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    pub approved: bool,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: VariancesApproved (bulk approval of every pending variance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariancesApproved {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub material_ids: Vec<MaterialId>,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReviewStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStarted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReturnedToCounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedToCounting {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PostingStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingStarted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub posted_by: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PostingAborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingAborted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub performed_by: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionPosted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPosted {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub posted_by: String,
    pub summary: PostingSummary,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SessionCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCancelled {
    pub tenant_id: TenantId,
    pub session_id: CountSessionId,
    pub cancelled_by: String,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountSessionEvent {
    SessionOpened(SessionOpened),
    CountingStarted(CountingStarted),
    CountRecorded(CountRecorded),
    ReasonCodeSet(ReasonCodeSet),
    NotesSet(NotesSet),
    ApprovalSet(ApprovalSet),
    VariancesApproved(VariancesApproved),
    ReviewStarted(ReviewStarted),
    ReturnedToCounting(ReturnedToCounting),
    PostingStarted(PostingStarted),
    PostingAborted(PostingAborted),
    SessionPosted(SessionPosted),
    SessionCancelled(SessionCancelled),
}

impl CountSessionEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            CountSessionEvent::SessionOpened(e) => e.tenant_id,
            CountSessionEvent::CountingStarted(e) => e.tenant_id,
            CountSessionEvent::CountRecorded(e) => e.tenant_id,
            CountSessionEvent::ReasonCodeSet(e) => e.tenant_id,
            CountSessionEvent::NotesSet(e) => e.tenant_id,
            CountSessionEvent::ApprovalSet(e) => e.tenant_id,
            CountSessionEvent::VariancesApproved(e) => e.tenant_id,
            CountSessionEvent::ReviewStarted(e) => e.tenant_id,
            CountSessionEvent::ReturnedToCounting(e) => e.tenant_id,
            CountSessionEvent::PostingStarted(e) => e.tenant_id,
            CountSessionEvent::PostingAborted(e) => e.tenant_id,
            CountSessionEvent::SessionPosted(e) => e.tenant_id,
            CountSessionEvent::SessionCancelled(e) => e.tenant_id,
        }
    }

    pub fn session_id(&self) -> CountSessionId {
        match self {
            CountSessionEvent::SessionOpened(e) => e.session_id,
            CountSessionEvent::CountingStarted(e) => e.session_id,
            CountSessionEvent::CountRecorded(e) => e.session_id,
            CountSessionEvent::ReasonCodeSet(e) => e.session_id,
            CountSessionEvent::NotesSet(e) => e.session_id,
            CountSessionEvent::ApprovalSet(e) => e.session_id,
            CountSessionEvent::VariancesApproved(e) => e.session_id,
            CountSessionEvent::ReviewStarted(e) => e.session_id,
            CountSessionEvent::ReturnedToCounting(e) => e.session_id,
            CountSessionEvent::PostingStarted(e) => e.session_id,
            CountSessionEvent::PostingAborted(e) => e.session_id,
            CountSessionEvent::SessionPosted(e) => e.session_id,
            CountSessionEvent::SessionCancelled(e) => e.session_id,
        }
    }
}

impl Event for CountSessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CountSessionEvent::SessionOpened(_) => "inventory.count_session.opened",
            CountSessionEvent::CountingStarted(_) => "inventory.count_session.counting_started",
            CountSessionEvent::CountRecorded(_) => "inventory.count_session.count_recorded",
            CountSessionEvent::ReasonCodeSet(_) => "inventory.count_session.reason_code_set",
            CountSessionEvent::NotesSet(_) => "inventory.count_session.notes_set",
            CountSessionEvent::ApprovalSet(_) => "inventory.count_session.approval_set",
            CountSessionEvent::VariancesApproved(_) => "inventory.count_session.variances_approved",
            CountSessionEvent::ReviewStarted(_) => "inventory.count_session.review_started",
            CountSessionEvent::ReturnedToCounting(_) => {
                "inventory.count_session.returned_to_counting"
            }
            CountSessionEvent::PostingStarted(_) => "inventory.count_session.posting_started",
            CountSessionEvent::PostingAborted(_) => "inventory.count_session.posting_aborted",
            CountSessionEvent::SessionPosted(_) => "inventory.count_session.posted",
            CountSessionEvent::SessionCancelled(_) => "inventory.count_session.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CountSessionEvent::SessionOpened(e) => e.occurred_at,
            CountSessionEvent::CountingStarted(e) => e.occurred_at,
            CountSessionEvent::CountRecorded(e) => e.occurred_at,
            CountSessionEvent::ReasonCodeSet(e) => e.occurred_at,
            CountSessionEvent::NotesSet(e) => e.occurred_at,
            CountSessionEvent::ApprovalSet(e) => e.occurred_at,
            CountSessionEvent::VariancesApproved(e) => e.occurred_at,
            CountSessionEvent::ReviewStarted(e) => e.occurred_at,
            CountSessionEvent::ReturnedToCounting(e) => e.occurred_at,
            CountSessionEvent::PostingStarted(e) => e.occurred_at,
            CountSessionEvent::PostingAborted(e) => e.occurred_at,
            CountSessionEvent::SessionPosted(e) => e.occurred_at,
            CountSessionEvent::SessionCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CountSession {
    type Command = CountSessionCommand;
    type Event = CountSessionEvent;
    type Error = CountError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CountSessionEvent::SessionOpened(e) => {
                self.id = e.session_id;
                self.tenant_id = Some(e.tenant_id);
                self.session_number = Some(e.session_number.clone());
                self.name = e.name.clone();
                self.scope = e.scope.clone();
                self.created_by = e.created_by.clone();
                self.status = CountSessionStatus::Draft;
                self.items.clear();
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            CountSessionEvent::CountingStarted(e) => {
                self.items = e.materials.iter().map(CountItem::from_snapshot).collect();
                self.status = CountSessionStatus::Counting;
            }
            CountSessionEvent::CountRecorded(e) => {
                if let Some(item) = self.item_mut(e.material_id) {
                    item.record_count(e.counted_quantity, &e.performed_by, e.occurred_at);
                }
            }
            CountSessionEvent::ReasonCodeSet(e) => {
                if let Some(item) = self.item_mut(e.material_id) {
                    item.reason_code = e.reason_code;
                }
            }
            CountSessionEvent::NotesSet(e) => {
                if let Some(item) = self.item_mut(e.material_id) {
                    item.notes = e.notes.clone();
                }
            }
            CountSessionEvent::ApprovalSet(e) => {
                if let Some(item) = self.item_mut(e.material_id) {
                    item.approved = e.approved && item.is_counted();
                }
            }
            CountSessionEvent::VariancesApproved(e) => {
                for material_id in &e.material_ids {
                    if let Some(item) = self.item_mut(*material_id) {
                        item.approved = item.is_counted();
                    }
                }
            }
            CountSessionEvent::ReviewStarted(_) => {
                self.status = CountSessionStatus::Review;
            }
            CountSessionEvent::ReturnedToCounting(_) => {
                self.status = CountSessionStatus::Counting;
            }
            CountSessionEvent::PostingStarted(e) => {
                self.posting_started_at = Some(e.occurred_at);
            }
            CountSessionEvent::PostingAborted(_) => {
                self.posting_started_at = None;
            }
            CountSessionEvent::SessionPosted(e) => {
                self.posting_started_at = None;
                self.status = CountSessionStatus::Posted;
                self.completed_at = Some(e.occurred_at);
                self.posting_summary = Some(e.summary);
            }
            CountSessionEvent::SessionCancelled(e) => {
                self.status = CountSessionStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if let CountSessionCommand::OpenSession(cmd) = command {
            return self.handle_open(cmd);
        }

        if !self.created {
            return Err(CountError::NotFound);
        }
        self.ensure_tenant(command.tenant_id())?;
        self.ensure_session_id(command.session_id())?;

        match command {
            CountSessionCommand::OpenSession(cmd) => self.handle_open(cmd),
            CountSessionCommand::SelectItems(cmd) => self.handle_select(cmd),
            CountSessionCommand::RecordCount(cmd) => self.handle_record_count(cmd),
            CountSessionCommand::SetReasonCode(cmd) => self.handle_set_reason(cmd),
            CountSessionCommand::SetNotes(cmd) => self.handle_set_notes(cmd),
            CountSessionCommand::SetApproval(cmd) => self.handle_set_approval(cmd),
            CountSessionCommand::ApproveAllVariances(cmd) => self.handle_approve_all(cmd),
            CountSessionCommand::SubmitForReview(cmd) => self.handle_submit(cmd),
            CountSessionCommand::ReturnToCounting(cmd) => self.handle_return(cmd),
            CountSessionCommand::BeginPosting(cmd) => self.handle_begin_posting(cmd),
            CountSessionCommand::AbortPosting(cmd) => self.handle_abort_posting(cmd),
            CountSessionCommand::MarkPosted(cmd) => self.handle_mark_posted(cmd),
            CountSessionCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl CountSession {
    fn item_mut(&mut self, material_id: MaterialId) -> Option<&mut CountItem> {
        self.items.iter_mut().find(|i| i.material_id == material_id)
    }

    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), CountError> {
        if self.tenant_id != Some(tenant_id) {
            return Err(CountError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_session_id(&self, session_id: CountSessionId) -> Result<(), CountError> {
        if self.id != session_id {
            return Err(CountError::invariant("session_id mismatch"));
        }
        Ok(())
    }

    /// Reject mutation of a terminal or reserved session, then require one
    /// of `allowed`.
    fn ensure_status(
        &self,
        allowed: &[CountSessionStatus],
        action: &'static str,
    ) -> Result<(), CountError> {
        if self.status.is_terminal() {
            return Err(CountError::SessionClosed(self.status));
        }
        if self.is_posting() {
            return Err(CountError::PostingInProgress);
        }
        if !allowed.contains(&self.status) {
            return Err(CountError::InvalidTransition {
                from: self.status,
                action,
            });
        }
        Ok(())
    }

    fn ensure_item(&self, material_id: MaterialId) -> Result<&CountItem, CountError> {
        self.item(material_id)
            .ok_or(CountError::UnknownMaterial(material_id))
    }

    fn handle_open(&self, cmd: &OpenSession) -> Result<Vec<CountSessionEvent>, CountError> {
        if self.created {
            return Err(CountError::invariant("count session already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(CountError::validation("session name cannot be empty"));
        }
        if cmd.created_by.trim().is_empty() {
            return Err(CountError::validation("created_by cannot be empty"));
        }

        Ok(vec![CountSessionEvent::SessionOpened(SessionOpened {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            session_number: cmd.session_number.clone(),
            name: cmd.name.trim().to_string(),
            scope: cmd.scope.clone(),
            created_by: cmd.created_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_select(&self, cmd: &SelectItems) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(&[CountSessionStatus::Draft], "select items")?;

        // First occurrence wins; a material is counted once per session.
        let mut materials: Vec<MaterialSnapshot> = Vec::with_capacity(cmd.materials.len());
        for snapshot in &cmd.materials {
            if !materials.iter().any(|m| m.material_id == snapshot.material_id) {
                materials.push(snapshot.clone());
            }
        }

        if materials.is_empty() {
            return Err(CountError::EmptySelection);
        }

        Ok(vec![CountSessionEvent::CountingStarted(CountingStarted {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            materials,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_count(&self, cmd: &RecordCount) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(&[CountSessionStatus::Counting], "record counts")?;
        self.ensure_item(cmd.material_id)?;

        if let Some(quantity) = cmd.counted_quantity {
            if quantity < 0 {
                return Err(CountError::validation("counted quantity cannot be negative"));
            }
        }

        Ok(vec![CountSessionEvent::CountRecorded(CountRecorded {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            material_id: cmd.material_id,
            counted_quantity: cmd.counted_quantity,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_reason(&self, cmd: &SetReasonCode) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(
            &[CountSessionStatus::Counting, CountSessionStatus::Review],
            "set reason codes",
        )?;
        self.ensure_item(cmd.material_id)?;

        Ok(vec![CountSessionEvent::ReasonCodeSet(ReasonCodeSet {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            material_id: cmd.material_id,
            reason_code: cmd.reason_code,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_notes(&self, cmd: &SetNotes) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(
            &[CountSessionStatus::Counting, CountSessionStatus::Review],
            "edit notes",
        )?;
        self.ensure_item(cmd.material_id)?;

        Ok(vec![CountSessionEvent::NotesSet(NotesSet {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            material_id: cmd.material_id,
            notes: cmd.notes.clone(),
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_approval(&self, cmd: &SetApproval) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(
            &[CountSessionStatus::Counting, CountSessionStatus::Review],
            "approve variances",
        )?;
        let item = self.ensure_item(cmd.material_id)?;

        // Approval of an uncounted line is meaningless.
        if cmd.approved && !item.is_counted() {
            return Err(CountError::NotCounted(cmd.material_id));
        }

        Ok(vec![CountSessionEvent::ApprovalSet(ApprovalSet {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            material_id: cmd.material_id,
            approved: cmd.approved,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve_all(
        &self,
        cmd: &ApproveAllVariances,
    ) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(
            &[CountSessionStatus::Counting, CountSessionStatus::Review],
            "approve variances",
        )?;

        let material_ids: Vec<MaterialId> = ApprovalGate::variant_items(&self.items)
            .filter(|item| !item.approved)
            .map(|item| item.material_id)
            .collect();

        if material_ids.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![CountSessionEvent::VariancesApproved(VariancesApproved {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            material_ids,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &SubmitForReview) -> Result<Vec<CountSessionEvent>, CountError> {
        // Partial counts are allowed; uncounted lines are left out of posting.
        self.ensure_status(&[CountSessionStatus::Counting], "submit for review")?;

        Ok(vec![CountSessionEvent::ReviewStarted(ReviewStarted {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_return(&self, cmd: &ReturnToCounting) -> Result<Vec<CountSessionEvent>, CountError> {
        self.ensure_status(&[CountSessionStatus::Review], "return to counting")?;

        Ok(vec![CountSessionEvent::ReturnedToCounting(ReturnedToCounting {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            performed_by: cmd.performed_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_begin_posting(
        &self,
        cmd: &BeginPosting,
    ) -> Result<Vec<CountSessionEvent>, CountError> {
        if self.status == CountSessionStatus::Posted {
            return Err(CountError::AlreadyPosted);
        }
        self.ensure_status(&[CountSessionStatus::Review], "post")?;
        self.check_approval()?;

        Ok(vec![CountSessionEvent::PostingStarted(PostingStarted {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            posted_by: cmd.posted_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_abort_posting(
        &self,
        cmd: &AbortPosting,
    ) -> Result<Vec<CountSessionEvent>, CountError> {
        if self.status.is_terminal() {
            return Err(CountError::SessionClosed(self.status));
        }
        if !self.is_posting() {
            return Err(CountError::InvalidTransition {
                from: self.status,
                action: "abort a posting that was not started",
            });
        }

        Ok(vec![CountSessionEvent::PostingAborted(PostingAborted {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            performed_by: cmd.performed_by.clone(),
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Finalize. Allowed with or without a reservation, never past the gate.
    fn handle_mark_posted(&self, cmd: &MarkPosted) -> Result<Vec<CountSessionEvent>, CountError> {
        match self.status {
            CountSessionStatus::Posted => return Err(CountError::AlreadyPosted),
            CountSessionStatus::Cancelled => return Err(CountError::SessionClosed(self.status)),
            CountSessionStatus::Review => {}
            from => return Err(CountError::InvalidTransition { from, action: "post" }),
        }
        self.check_approval()?;

        Ok(vec![CountSessionEvent::SessionPosted(SessionPosted {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            posted_by: cmd.posted_by.clone(),
            summary: cmd.summary,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<CountSessionEvent>, CountError> {
        if self.status.is_terminal() {
            return Err(CountError::SessionClosed(self.status));
        }
        if self.is_posting() {
            return Err(CountError::PostingInProgress);
        }

        Ok(vec![CountSessionEvent::SessionCancelled(SessionCancelled {
            tenant_id: cmd.tenant_id,
            session_id: cmd.session_id,
            cancelled_by: cmd.cancelled_by.clone(),
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
