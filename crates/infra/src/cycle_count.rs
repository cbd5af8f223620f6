//! Cycle-count application service.
//!
//! Each operation follows the same pipeline: load the session from the
//! session store, let the aggregate decide events, persist them against the
//! loaded version, apply them locally, and return the updated session.

use chrono::{DateTime, Utc};
use thiserror::Error;

use facilityops_core::{Aggregate, AggregateRoot, TenantId};
use facilityops_inventory::{
    AbortPosting, ApprovalReport, ApproveAllVariances, BeginPosting, Cancel, CountError,
    CountSession, CountSessionCommand, CountSessionId, CountSessionStatus, LedgerEntry,
    MarkPosted, Material, MaterialId, MaterialQuery, MaterialSnapshot, OpenSession, ReasonCode,
    RecordCount, ReturnToCounting, ScopeFilter, SelectItems, SessionNumber, SetApproval,
    SetNotes, SetReasonCode, SubmitForReview,
};

use crate::catalog::{CatalogError, MaterialCatalog};
use crate::config::CycleCountConfig;
use crate::ledger_store::{LedgerError, LedgerStore};
use crate::posting::{PostingEngine, PostingError, PostingReceipt};
use crate::session_store::{SessionStore, SessionStoreError};

/// How a caller should react to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fix the input and try again.
    Validation,
    /// State moved underneath the caller; re-fetch and retry.
    Conflict,
    /// Misuse of the workflow or a broken invariant.
    Invariant,
    /// Storage or collaborator failure; retry with backoff.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CycleCountError {
    #[error(transparent)]
    Domain(#[from] CountError),

    #[error("material {0} not found in catalog")]
    MaterialNotFound(MaterialId),

    #[error(transparent)]
    Posting(#[from] PostingError),

    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn count_error_kind(err: &CountError) -> ErrorKind {
    if err.is_validation() {
        return ErrorKind::Validation;
    }
    match err {
        CountError::NotFound => ErrorKind::Validation,
        CountError::PostingInProgress => ErrorKind::Conflict,
        _ => ErrorKind::Invariant,
    }
}

fn catalog_error_kind(err: &CatalogError) -> ErrorKind {
    match err {
        CatalogError::NotFound(_)
        | CatalogError::InvalidQuantity(_)
        | CatalogError::Duplicate(_) => ErrorKind::Validation,
        CatalogError::Conflict { .. } | CatalogError::NegativeOnHand { .. } => ErrorKind::Conflict,
        CatalogError::CompensationFailed { .. } => ErrorKind::Invariant,
        CatalogError::Storage(_) => ErrorKind::Infrastructure,
    }
}

fn ledger_error_kind(err: &LedgerError) -> ErrorKind {
    match err {
        LedgerError::DuplicateSession(_) => ErrorKind::Invariant,
        LedgerError::ForeignEntry { .. } => ErrorKind::Invariant,
        LedgerError::Storage(_) => ErrorKind::Infrastructure,
    }
}

impl CycleCountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CycleCountError::Domain(e) => count_error_kind(e),
            CycleCountError::MaterialNotFound(_) => ErrorKind::Validation,
            CycleCountError::Posting(e) => match e {
                PostingError::AlreadyPosted(_) => ErrorKind::Invariant,
                PostingError::InProgress(_) | PostingError::PostingConflict(_) => {
                    ErrorKind::Conflict
                }
                PostingError::Domain(e) => count_error_kind(e),
                PostingError::Catalog(e) => catalog_error_kind(e),
                PostingError::Ledger(e) => ledger_error_kind(e),
                PostingError::LedgerMismatch(_) | PostingError::CompensationFailed { .. } => {
                    ErrorKind::Invariant
                }
            },
            CycleCountError::SessionStore(e) => match e {
                SessionStoreError::Concurrency(_) => ErrorKind::Conflict,
                SessionStoreError::TenantIsolation(_) => ErrorKind::Invariant,
                SessionStoreError::Deserialize(_) | SessionStoreError::Store(_) => {
                    ErrorKind::Infrastructure
                }
            },
            CycleCountError::Catalog(e) => catalog_error_kind(e),
            CycleCountError::Ledger(e) => ledger_error_kind(e),
        }
    }

    pub fn is_already_posted(&self) -> bool {
        matches!(
            self,
            CycleCountError::Domain(CountError::AlreadyPosted)
                | CycleCountError::Posting(PostingError::AlreadyPosted(_))
        )
    }
}

/// Count-session workflow over the session store, catalog, and ledger.
pub struct CycleCountService<S, C, L> {
    sessions: S,
    catalog: C,
    posting: PostingEngine<C, L>,
    /// Reloads tolerated when finalizing a posting races another writer.
    finalize_attempts: u32,
}

impl<S, C, L> CycleCountService<S, C, L>
where
    S: SessionStore,
    C: MaterialCatalog + Clone,
    L: LedgerStore,
{
    pub fn new(sessions: S, catalog: C, ledger: L, config: CycleCountConfig) -> Self {
        let finalize_attempts = config.posting.max_attempts.max(1);
        let posting = PostingEngine::new(catalog.clone(), ledger, config.posting);
        Self {
            sessions,
            catalog,
            posting,
            finalize_attempts,
        }
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    pub fn posting_engine(&self) -> &PostingEngine<C, L> {
        &self.posting
    }

    /// Create a Draft session with a generated `CNT-YYMMDD-###` number.
    #[tracing::instrument(skip(self), fields(%tenant_id))]
    pub fn open_session(
        &self,
        tenant_id: TenantId,
        name: &str,
        scope: ScopeFilter,
        created_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        let session_id = self.sessions.next_id();
        let now = Utc::now();
        let session_number = SessionNumber::generate(now.date_naive(), &mut rand::thread_rng());

        let mut session = CountSession::empty(session_id);
        let events = session.handle(&CountSessionCommand::OpenSession(OpenSession {
            tenant_id,
            session_id,
            session_number,
            name: name.to_string(),
            scope,
            created_by: created_by.to_string(),
            occurred_at: now,
        }))?;

        self.sessions.create(tenant_id, session_id, &events)?;
        for e in &events {
            session.apply(e);
        }

        tracing::info!(
            %session_id,
            session_number = %session.session_number().map(|n| n.as_str()).unwrap_or_default(),
            "count session opened"
        );
        Ok(session)
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<CountSession, CycleCountError> {
        self.sessions
            .get(tenant_id, session_id)?
            .ok_or(CycleCountError::Domain(CountError::NotFound))
    }

    /// Free catalog search (any scope).
    pub fn search_materials(
        &self,
        tenant_id: TenantId,
        query: &MaterialQuery,
    ) -> Result<Vec<Material>, CycleCountError> {
        Ok(self.catalog.search(tenant_id, query)?)
    }

    /// Candidates for a session: its scope, narrowed by an optional search term.
    pub fn candidates(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        search: Option<&str>,
    ) -> Result<Vec<Material>, CycleCountError> {
        let session = self.get(tenant_id, session_id)?;
        let mut query = MaterialQuery::for_scope(session.scope().clone());
        if let Some(term) = search {
            query = query.with_search(term);
        }
        self.search_materials(tenant_id, &query)
    }

    /// Snapshot the chosen materials and start counting.
    #[tracing::instrument(
        skip(self, material_ids),
        fields(%tenant_id, %session_id, selected = material_ids.len())
    )]
    pub fn select_items(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        material_ids: &[MaterialId],
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        let session = self.get(tenant_id, session_id)?;

        let mut snapshots: Vec<MaterialSnapshot> = Vec::with_capacity(material_ids.len());
        for material_id in material_ids {
            if snapshots.iter().any(|s| s.material_id == *material_id) {
                continue;
            }
            let material = self
                .catalog
                .get(tenant_id, *material_id)?
                .ok_or(CycleCountError::MaterialNotFound(*material_id))?;
            snapshots.push(material.snapshot());
        }

        let session = self.execute(
            session,
            CountSessionCommand::SelectItems(SelectItems {
                tenant_id,
                session_id,
                materials: snapshots,
                performed_by: performed_by.to_string(),
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(items = session.items().len(), "counting started");
        Ok(session)
    }

    /// Enter (or clear, with `None`) a physical count.
    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id, %material_id))]
    pub fn record_count(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        material_id: MaterialId,
        counted_quantity: Option<i64>,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::RecordCount(RecordCount {
                tenant_id,
                session_id,
                material_id,
                counted_quantity,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id, %material_id))]
    pub fn set_reason_code(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        material_id: MaterialId,
        reason_code: Option<ReasonCode>,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::SetReasonCode(SetReasonCode {
                tenant_id,
                session_id,
                material_id,
                reason_code,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    #[tracing::instrument(skip(self, notes), fields(%tenant_id, %session_id, %material_id))]
    pub fn set_notes(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        material_id: MaterialId,
        notes: &str,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::SetNotes(SetNotes {
                tenant_id,
                session_id,
                material_id,
                notes: notes.to_string(),
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id, %material_id))]
    pub fn set_approval(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        material_id: MaterialId,
        approved: bool,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::SetApproval(SetApproval {
                tenant_id,
                session_id,
                material_id,
                approved,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    /// Approve every counted line with a variance, in one event.
    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id))]
    pub fn approve_all_variances(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::ApproveAllVariances(ApproveAllVariances {
                tenant_id,
                session_id,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id))]
    pub fn submit_for_review(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        let session = self.run(tenant_id, session_id, |now| {
            CountSessionCommand::SubmitForReview(SubmitForReview {
                tenant_id,
                session_id,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })?;
        let progress = session.progress();
        tracing::info!(
            counted = progress.counted,
            total = progress.total,
            "count session in review"
        );
        Ok(session)
    }

    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id))]
    pub fn return_to_counting(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        performed_by: &str,
    ) -> Result<CountSession, CycleCountError> {
        self.run(tenant_id, session_id, |now| {
            CountSessionCommand::ReturnToCounting(ReturnToCounting {
                tenant_id,
                session_id,
                performed_by: performed_by.to_string(),
                occurred_at: now,
            })
        })
    }

    /// Run the approval gate without changing anything.
    pub fn check_approval(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<(), CycleCountError> {
        Ok(self.get(tenant_id, session_id)?.check_approval()?)
    }

    pub fn approval_report(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<ApprovalReport, CycleCountError> {
        Ok(self.get(tenant_id, session_id)?.approval_report())
    }

    /// Apply the session's approved variances and mark it `Posted`.
    ///
    /// The session is reserved (`PostingStarted`) before the catalog is
    /// touched, so no edit or cancellation can land between applying the
    /// deltas and finalizing. A failure that applied nothing releases the
    /// reservation again.
    ///
    /// If the ledger already holds this session's posting (an earlier call
    /// failed after writing it), the session is finalized from that record
    /// and no delta is applied again.
    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id))]
    pub fn post(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        posted_by: &str,
    ) -> Result<PostingReceipt, CycleCountError> {
        let session = self.get(tenant_id, session_id)?;
        if session.status() == CountSessionStatus::Posted {
            return Err(PostingError::AlreadyPosted(session_id).into());
        }

        let posted_at = Utc::now();
        let (session, receipt) = match self.posting.recorded(tenant_id, &session)? {
            Some(receipt) => {
                tracing::warn!("ledger already holds this posting; finalizing session from it");
                (session, receipt)
            }
            None => {
                let reserved = self.reserve(tenant_id, session, posted_by, posted_at)?;
                let receipt = self.apply_reserved(tenant_id, &reserved, posted_by, posted_at)?;
                (reserved, receipt)
            }
        };

        self.finalize(tenant_id, session, &receipt, posted_by, posted_at)?;

        tracing::info!(
            adjusted_items = receipt.summary.adjusted_items,
            net_value_cents = receipt.summary.net_value_cents(),
            recovered = receipt.recovered,
            "count session posted"
        );
        Ok(receipt)
    }

    /// Persist the posting reservation unless an interrupted attempt left one.
    fn reserve(
        &self,
        tenant_id: TenantId,
        session: CountSession,
        posted_by: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<CountSession, CycleCountError> {
        if session.is_posting() {
            tracing::warn!("resuming a posting whose reservation is still held");
            return Ok(session);
        }
        let session_id = session.id_typed();
        self.execute(
            session,
            CountSessionCommand::BeginPosting(BeginPosting {
                tenant_id,
                session_id,
                posted_by: posted_by.to_string(),
                occurred_at: posted_at,
            }),
        )
    }

    fn apply_reserved(
        &self,
        tenant_id: TenantId,
        session: &CountSession,
        posted_by: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<PostingReceipt, CycleCountError> {
        self.posting
            .post(tenant_id, session, posted_by, posted_at)
            .map_err(|err| {
                let applied_nothing = !matches!(
                    err,
                    PostingError::InProgress(_)
                        | PostingError::AlreadyPosted(_)
                        | PostingError::LedgerMismatch(_)
                        | PostingError::CompensationFailed { .. }
                );
                if applied_nothing {
                    self.release(tenant_id, session.clone(), posted_by, &err);
                }
                err.into()
            })
    }

    /// Best-effort `AbortPosting`, only while the ledger holds no record.
    fn release(
        &self,
        tenant_id: TenantId,
        session: CountSession,
        performed_by: &str,
        cause: &PostingError,
    ) {
        let session_id = session.id_typed();
        match self.posting.ledger().is_posted(tenant_id, session_id) {
            Ok(false) => {}
            Ok(true) => return,
            Err(err) => {
                tracing::warn!(error = %err, "ledger unreadable; keeping posting reservation");
                return;
            }
        }

        let aborted = self.execute(
            session,
            CountSessionCommand::AbortPosting(AbortPosting {
                tenant_id,
                session_id,
                performed_by: performed_by.to_string(),
                reason: cause.to_string(),
                occurred_at: Utc::now(),
            }),
        );
        match aborted {
            Ok(_) => tracing::info!(cause = %cause, "posting failed; reservation released"),
            Err(err) => tracing::warn!(
                error = %err,
                "posting reservation not released; post again to resume"
            ),
        }
    }

    /// `MarkPosted`, reloading and retrying when another writer got there first.
    fn finalize(
        &self,
        tenant_id: TenantId,
        mut session: CountSession,
        receipt: &PostingReceipt,
        posted_by: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<(), CycleCountError> {
        let session_id = session.id_typed();
        let mut attempt = 1;
        loop {
            let marked = self.execute(
                session,
                CountSessionCommand::MarkPosted(MarkPosted {
                    tenant_id,
                    session_id,
                    posted_by: posted_by.to_string(),
                    summary: receipt.summary,
                    occurred_at: posted_at,
                }),
            );
            match marked {
                Ok(_) => return Ok(()),
                Err(CycleCountError::SessionStore(SessionStoreError::Concurrency(conflict)))
                    if attempt < self.finalize_attempts =>
                {
                    tracing::warn!(
                        attempt,
                        %conflict,
                        "session changed while finalizing; reloading"
                    );
                    attempt += 1;
                    session = self.get(tenant_id, session_id)?;
                    if session.status() == CountSessionStatus::Posted {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "posting applied but session not marked posted; retry post to finalize"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Cancel a non-terminal session. Touches neither catalog nor ledger.
    #[tracing::instrument(skip(self), fields(%tenant_id, %session_id))]
    pub fn cancel(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        cancelled_by: &str,
        reason: Option<&str>,
    ) -> Result<CountSession, CycleCountError> {
        let session = self.run(tenant_id, session_id, |now| {
            CountSessionCommand::Cancel(Cancel {
                tenant_id,
                session_id,
                cancelled_by: cancelled_by.to_string(),
                reason: reason.map(str::to_string),
                occurred_at: now,
            })
        })?;
        tracing::info!("count session cancelled");
        Ok(session)
    }

    /// Ledger entries written by this session's posting.
    pub fn ledger_entries(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Vec<LedgerEntry>, CycleCountError> {
        Ok(self.posting.ledger().entries_for_session(tenant_id, session_id)?)
    }

    fn run(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        make_command: impl FnOnce(DateTime<Utc>) -> CountSessionCommand,
    ) -> Result<CountSession, CycleCountError> {
        let session = self.get(tenant_id, session_id)?;
        self.execute(session, make_command(Utc::now()))
    }

    /// Decide, persist against the loaded version, then apply locally.
    fn execute(
        &self,
        mut session: CountSession,
        command: CountSessionCommand,
    ) -> Result<CountSession, CycleCountError> {
        let events = session.handle(&command)?;
        if events.is_empty() {
            return Ok(session);
        }

        self.sessions
            .update(command.tenant_id(), session.id_typed(), session.version(), &events)?;
        for e in &events {
            session.apply(e);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facilityops_core::AggregateId;

    #[test]
    fn validation_errors_ask_for_new_input() {
        let err = CycleCountError::from(CountError::UnapprovedVariances(3));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "3 variance(s) require approval");
    }

    #[test]
    fn posting_conflicts_ask_for_retry() {
        let material = MaterialId::new(AggregateId::new());
        let err = CycleCountError::from(PostingError::PostingConflict(material));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let stale = CycleCountError::from(SessionStoreError::Concurrency("v3 != v4".to_string()));
        assert_eq!(stale.kind(), ErrorKind::Conflict);

        let reserved = CycleCountError::from(CountError::PostingInProgress);
        assert_eq!(reserved.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn already_posted_and_closed_sessions_are_invariant_errors() {
        let session = CountSessionId::new(AggregateId::new());
        let twice = CycleCountError::from(PostingError::AlreadyPosted(session));
        assert_eq!(twice.kind(), ErrorKind::Invariant);
        assert!(twice.is_already_posted());

        let closed = CountError::SessionClosed(CountSessionStatus::Cancelled);
        assert_eq!(CycleCountError::from(closed).kind(), ErrorKind::Invariant);

        let mismatch = CycleCountError::from(PostingError::LedgerMismatch(session));
        assert_eq!(mismatch.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn storage_failures_are_infrastructure() {
        let err = CycleCountError::from(CatalogError::Storage("unreachable".to_string()));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }
}
