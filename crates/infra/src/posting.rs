//! Posting engine: applies a reviewed session's approved variances to the
//! catalog and writes the adjustment ledger, as one unit.
//!
//! Order of effects:
//! 1. guard against double posting (session status, ledger record, in-flight set)
//! 2. require the session's posting reservation and re-run the approval gate
//! 3. apply all on-hand deltas through one `apply_batch` (version CAS,
//!    bounded retry per material on conflict)
//! 4. value and record every ledger entry in one call, reverting step 3 if
//!    either fails
//!
//! Reserving the session (`BeginPosting`) before this runs and marking it
//! `Posted` after it returns are the caller's job.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use facilityops_core::{ExpectedVersion, TenantId};
use facilityops_inventory::{
    CountError, CountSession, CountSessionId, CountSessionStatus, LedgerEntry, MaterialId,
    PostingLine, PostingSummary,
};

use crate::catalog::{AppliedAdjustment, CatalogError, MaterialCatalog, OnHandAdjustment};
use crate::config::PostingConfig;
use crate::ledger_store::{LedgerError, LedgerStore};

#[derive(Debug, Error)]
pub enum PostingError {
    #[error("count session {0} is already posted")]
    AlreadyPosted(CountSessionId),

    #[error("count session {0} is already being posted")]
    InProgress(CountSessionId),

    #[error(transparent)]
    Domain(#[from] CountError),

    /// Version conflicts on this material exhausted the retry budget.
    #[error("material {0} kept changing during posting; re-fetch and retry")]
    PostingConflict(MaterialId),

    #[error(transparent)]
    Catalog(CatalogError),

    #[error(transparent)]
    Ledger(LedgerError),

    /// The ledger holds a posting for this session that is not its current
    /// posting set. Needs manual reconciliation.
    #[error("ledger record of count session {0} does not match its approved variances")]
    LedgerMismatch(CountSessionId),

    /// A rollback failed: the catalog may hold a partial posting.
    #[error("posting rollback failed for material {material_id}: {reason}")]
    CompensationFailed { material_id: MaterialId, reason: String },
}

impl From<CatalogError> for PostingError {
    fn from(value: CatalogError) -> Self {
        match value {
            CatalogError::CompensationFailed { material_id, reason } => {
                PostingError::CompensationFailed { material_id, reason }
            }
            other => PostingError::Catalog(other),
        }
    }
}

/// What a successful posting wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingReceipt {
    pub session_id: CountSessionId,
    pub entries: Vec<LedgerEntry>,
    pub summary: PostingSummary,
    /// Built from an earlier posting's ledger record rather than applied now.
    pub recovered: bool,
}

impl PostingReceipt {
    fn new(
        session_id: CountSessionId,
        entries: Vec<LedgerEntry>,
        recovered: bool,
    ) -> Result<Self, CountError> {
        let summary = PostingSummary::from_entries(&entries)?;
        Ok(Self {
            session_id,
            entries,
            summary,
            recovered,
        })
    }

    /// Entries priced from what the catalog reported applying.
    fn priced(
        session_id: CountSessionId,
        lines: &[PostingLine],
        applied: &[AppliedAdjustment],
        posted_by: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<Self, CountError> {
        let entries = lines
            .iter()
            .zip(applied)
            .map(|(line, done)| {
                LedgerEntry::new(session_id, line, done.unit_price_cents, posted_by, posted_at)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(session_id, entries, false)
    }
}

/// Same materials with the same deltas, in any order.
fn same_adjustments(entries: &[LedgerEntry], lines: &[PostingLine]) -> bool {
    let recorded: HashMap<MaterialId, i64> =
        entries.iter().map(|e| (e.material_id, e.quantity_delta)).collect();
    let expected: HashMap<MaterialId, i64> =
        lines.iter().map(|l| (l.material_id, l.quantity_delta)).collect();
    entries.len() == lines.len() && recorded == expected
}

type PostingKey = (TenantId, CountSessionId);

/// Holds a session in the in-flight set until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PostingKey>>,
    key: PostingKey,
}

impl<'a> InFlight<'a> {
    fn acquire(
        set: &'a Mutex<HashSet<PostingKey>>,
        key: PostingKey,
    ) -> Result<Self, PostingError> {
        let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.insert(key) {
            return Err(PostingError::InProgress(key.1));
        }
        Ok(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(&self.key);
    }
}

pub struct PostingEngine<C, L> {
    catalog: C,
    ledger: L,
    config: PostingConfig,
    in_flight: Mutex<HashSet<PostingKey>>,
}

impl<C, L> PostingEngine<C, L> {
    pub fn new(catalog: C, ledger: L, config: PostingConfig) -> Self {
        Self {
            catalog,
            ledger,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }
}

impl<C, L> PostingEngine<C, L>
where
    C: MaterialCatalog,
    L: LedgerStore,
{
    /// Post a session in `Review` that holds a posting reservation.
    #[tracing::instrument(
        name = "posting_engine.post",
        skip_all,
        fields(session_id = %session.id_typed(), %tenant_id, %posted_by)
    )]
    pub fn post(
        &self,
        tenant_id: TenantId,
        session: &CountSession,
        posted_by: &str,
        posted_at: DateTime<Utc>,
    ) -> Result<PostingReceipt, PostingError> {
        let session_id = session.id_typed();

        if session.tenant_id() != Some(tenant_id) {
            return Err(CountError::invariant("tenant mismatch").into());
        }
        if session.status() == CountSessionStatus::Posted {
            return Err(PostingError::AlreadyPosted(session_id));
        }

        let _in_flight = InFlight::acquire(&self.in_flight, (tenant_id, session_id))?;

        if self.ledger.is_posted(tenant_id, session_id).map_err(PostingError::Ledger)? {
            return Err(PostingError::AlreadyPosted(session_id));
        }
        if session.status() != CountSessionStatus::Review {
            return Err(CountError::InvalidTransition {
                from: session.status(),
                action: "post",
            }
            .into());
        }
        if !session.is_posting() {
            return Err(CountError::InvalidTransition {
                from: session.status(),
                action: "post before the session is reserved",
            }
            .into());
        }
        session.check_approval()?;

        let lines = session.posting_set();
        let applied = self.apply_with_retry(tenant_id, &lines)?;

        let priced = PostingReceipt::priced(session_id, &lines, &applied, posted_by, posted_at);
        let receipt = match priced {
            Ok(receipt) => receipt,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "ledger entries cannot be valued; reverting catalog adjustments"
                );
                self.catalog.revert(tenant_id, &applied)?;
                return Err(err.into());
            }
        };

        if let Err(err) = self.ledger.record(tenant_id, session_id, receipt.entries.clone()) {
            tracing::warn!(error = %err, "ledger write failed; reverting catalog adjustments");
            self.catalog.revert(tenant_id, &applied)?;
            return Err(match err {
                LedgerError::DuplicateSession(id) => PostingError::AlreadyPosted(id),
                other => PostingError::Ledger(other),
            });
        }

        tracing::info!(
            adjusted_items = receipt.summary.adjusted_items,
            positive_value_cents = receipt.summary.positive_value_cents,
            negative_value_cents = receipt.summary.negative_value_cents,
            "count session posted to catalog"
        );
        Ok(receipt)
    }

    /// Receipt of an earlier posting of `session`, if the ledger has one.
    ///
    /// The recorded entries must be the session's current posting set.
    /// Otherwise the session is not finalized from them and
    /// [`PostingError::LedgerMismatch`] is returned.
    pub fn recorded(
        &self,
        tenant_id: TenantId,
        session: &CountSession,
    ) -> Result<Option<PostingReceipt>, PostingError> {
        let session_id = session.id_typed();
        if !self.ledger.is_posted(tenant_id, session_id).map_err(PostingError::Ledger)? {
            return Ok(None);
        }
        let entries = self
            .ledger
            .entries_for_session(tenant_id, session_id)
            .map_err(PostingError::Ledger)?;

        if !same_adjustments(&entries, &session.posting_set()) {
            tracing::error!(
                %session_id,
                recorded_entries = entries.len(),
                "ledger record does not match the session's posting set"
            );
            return Err(PostingError::LedgerMismatch(session_id));
        }
        Ok(Some(PostingReceipt::new(session_id, entries, true)?))
    }

    /// Read current versions, apply the whole batch, and start over on a
    /// version conflict until one material exhausts its attempts.
    fn apply_with_retry(
        &self,
        tenant_id: TenantId,
        lines: &[PostingLine],
    ) -> Result<Vec<AppliedAdjustment>, PostingError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut conflicts: HashMap<MaterialId, u32> = HashMap::new();

        loop {
            let adjustments = self.read_adjustments(tenant_id, lines)?;
            match self.catalog.apply_batch(tenant_id, &adjustments) {
                Ok(applied) => return Ok(applied),
                Err(CatalogError::Conflict { material_id, .. }) => {
                    let attempts = conflicts.entry(material_id).or_insert(0);
                    *attempts += 1;
                    if *attempts >= max_attempts {
                        tracing::warn!(
                            %material_id,
                            attempts = *attempts,
                            "posting conflict; giving up"
                        );
                        return Err(PostingError::PostingConflict(material_id));
                    }
                    tracing::warn!(
                        %material_id,
                        attempts = *attempts,
                        "material changed during posting; retrying"
                    );
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    fn read_adjustments(
        &self,
        tenant_id: TenantId,
        lines: &[PostingLine],
    ) -> Result<Vec<OnHandAdjustment>, PostingError> {
        lines
            .iter()
            .map(|line| {
                let material = self
                    .catalog
                    .get(tenant_id, line.material_id)?
                    .ok_or(CatalogError::NotFound(line.material_id))?;
                Ok(OnHandAdjustment {
                    material_id: line.material_id,
                    expected_version: ExpectedVersion::Exact(material.version),
                    delta: line.quantity_delta,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use facilityops_core::{Aggregate, AggregateId};
    use facilityops_inventory::{
        BeginPosting, CountSessionCommand, Material, OpenSession, ReasonCode, RecordCount,
        ScopeFilter, SelectItems, SessionNumber, SetApproval, SetReasonCode, SubmitForReview,
    };
    use proptest::prelude::*;

    use crate::catalog::InMemoryMaterialCatalog;
    use crate::ledger_store::InMemoryLedgerStore;

    struct Setup {
        tenant: TenantId,
        catalog: Arc<InMemoryMaterialCatalog>,
        ledger: Arc<InMemoryLedgerStore>,
        engine: PostingEngine<Arc<InMemoryMaterialCatalog>, Arc<InMemoryLedgerStore>>,
    }

    fn setup() -> Setup {
        let catalog = Arc::new(InMemoryMaterialCatalog::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let engine = PostingEngine::new(catalog.clone(), ledger.clone(), PostingConfig::default());
        Setup {
            tenant: TenantId::new(),
            catalog,
            ledger,
            engine,
        }
    }

    fn material(on_hand: i64, price: i64) -> Material {
        Material {
            id: MaterialId::new(AggregateId::new()),
            name: "Hose clamp".to_string(),
            sku: "HC-1".to_string(),
            material_number: "100-200".to_string(),
            department_code: "MAINT".to_string(),
            location: None,
            category: None,
            unit_of_measure: "EA".to_string(),
            unit_price_cents: price,
            on_hand_quantity: on_hand,
            version: 0,
        }
    }

    fn run(session: &mut CountSession, command: CountSessionCommand) {
        for e in session.handle(&command).unwrap() {
            session.apply(&e);
        }
    }

    /// Session in Review with one approved, explained count per `(material, counted)`.
    fn reviewed(tenant_id: TenantId, counts: &[(&Material, i64)]) -> CountSession {
        let mut session = submitted(tenant_id, counts);
        let session_id = session.id_typed();
        run(
            &mut session,
            CountSessionCommand::BeginPosting(BeginPosting {
                tenant_id,
                session_id,
                posted_by: "lee".to_string(),
                occurred_at: Utc::now(),
            }),
        );
        session
    }

    /// Like [`reviewed`], without the posting reservation.
    fn submitted(tenant_id: TenantId, counts: &[(&Material, i64)]) -> CountSession {
        let session_id = CountSessionId::new(AggregateId::new());
        let mut session = CountSession::empty(session_id);
        let now = Utc::now();
        run(
            &mut session,
            CountSessionCommand::OpenSession(OpenSession {
                tenant_id,
                session_id,
                session_number: SessionNumber::from_parts(
                    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                    1,
                ),
                name: "Posting test".to_string(),
                scope: ScopeFilter::All,
                created_by: "alex".to_string(),
                occurred_at: now,
            }),
        );
        run(
            &mut session,
            CountSessionCommand::SelectItems(SelectItems {
                tenant_id,
                session_id,
                materials: counts.iter().map(|(m, _)| m.snapshot()).collect(),
                performed_by: "alex".to_string(),
                occurred_at: now,
            }),
        );
        for (m, counted) in counts {
            run(
                &mut session,
                CountSessionCommand::RecordCount(RecordCount {
                    tenant_id,
                    session_id,
                    material_id: m.id,
                    counted_quantity: Some(*counted),
                    performed_by: "sam".to_string(),
                    occurred_at: now,
                }),
            );
            if *counted != m.on_hand_quantity {
                run(
                    &mut session,
                    CountSessionCommand::SetReasonCode(SetReasonCode {
                        tenant_id,
                        session_id,
                        material_id: m.id,
                        reason_code: Some(ReasonCode::CycleCountError),
                        performed_by: "lee".to_string(),
                        occurred_at: now,
                    }),
                );
                run(
                    &mut session,
                    CountSessionCommand::SetApproval(SetApproval {
                        tenant_id,
                        session_id,
                        material_id: m.id,
                        approved: true,
                        performed_by: "lee".to_string(),
                        occurred_at: now,
                    }),
                );
            }
        }
        run(
            &mut session,
            CountSessionCommand::SubmitForReview(SubmitForReview {
                tenant_id,
                session_id,
                performed_by: "sam".to_string(),
                occurred_at: now,
            }),
        );
        session
    }

    #[test]
    fn posting_applies_deltas_and_prices_at_posting_time() {
        let s = setup();
        let bolts = material(100, 40);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 96)]);

        let receipt = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap();

        assert_eq!(receipt.entries.len(), 1);
        assert_eq!(receipt.entries[0].quantity_delta, -4);
        assert_eq!(receipt.summary.negative_value_cents, 160);
        assert_eq!(s.catalog.get(s.tenant, bolts.id).unwrap().unwrap().on_hand_quantity, 96);
        assert!(s.ledger.is_posted(s.tenant, session.id_typed()).unwrap());
    }

    #[test]
    fn second_post_is_rejected_by_the_ledger_record() {
        let s = setup();
        let bolts = material(10, 40);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 12)]);

        s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap();
        let err = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap_err();

        assert!(matches!(err, PostingError::AlreadyPosted(_)));
        assert_eq!(s.catalog.get(s.tenant, bolts.id).unwrap().unwrap().on_hand_quantity, 12);
        assert_eq!(s.ledger.entry_count(s.tenant).unwrap(), 1);
    }

    #[test]
    fn concurrent_movement_is_preserved() {
        let s = setup();
        let bolts = material(50, 10);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 45)]);

        // Receipt lands between count and posting.
        s.catalog.receive(s.tenant, bolts.id, 20).unwrap();
        s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap();

        assert_eq!(s.catalog.get(s.tenant, bolts.id).unwrap().unwrap().on_hand_quantity, 65);
    }

    #[test]
    fn in_flight_posting_of_same_session_is_rejected() {
        let s = setup();
        let bolts = material(10, 40);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 11)]);
        let key = (s.tenant, session.id_typed());
        let _held = InFlight::acquire(&s.engine.in_flight, key).unwrap();

        let err = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap_err();
        assert!(matches!(err, PostingError::InProgress(_)));
        assert_eq!(s.catalog.get(s.tenant, bolts.id).unwrap().unwrap().on_hand_quantity, 10);
    }

    #[test]
    fn recorded_rebuilds_receipt_from_ledger() {
        let s = setup();
        let bolts = material(10, 300);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 13)]);

        assert!(s.engine.recorded(s.tenant, &session).unwrap().is_none());
        let posted = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap();
        let recovered = s.engine.recorded(s.tenant, &session).unwrap().unwrap();

        assert!(recovered.recovered);
        assert_eq!(recovered.entries, posted.entries);
        assert_eq!(recovered.summary.positive_value_cents, 900);
    }

    #[test]
    fn recorded_refuses_a_ledger_that_disagrees_with_the_session() {
        let s = setup();
        let bolts = material(10, 300);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&bolts, 13)]);
        let stale = PostingLine {
            material_id: bolts.id,
            quantity_delta: 5,
        };
        let entry = LedgerEntry::new(session.id_typed(), &stale, 300, "lee", Utc::now()).unwrap();
        s.ledger.record(s.tenant, session.id_typed(), vec![entry]).unwrap();

        let err = s.engine.recorded(s.tenant, &session).unwrap_err();
        assert!(matches!(err, PostingError::LedgerMismatch(id) if id == session.id_typed()));
    }

    #[test]
    fn unreserved_session_is_not_posted() {
        let s = setup();
        let bolts = material(10, 40);
        s.catalog.insert(s.tenant, bolts.clone()).unwrap();
        let session = submitted(s.tenant, &[(&bolts, 11)]);

        let err = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            PostingError::Domain(CountError::InvalidTransition {
                from: CountSessionStatus::Review,
                ..
            })
        ));
        assert_eq!(s.catalog.get(s.tenant, bolts.id).unwrap().unwrap().on_hand_quantity, 10);
        assert!(!s.ledger.is_posted(s.tenant, session.id_typed()).unwrap());
    }

    #[test]
    fn value_overflow_reverts_the_catalog() {
        let s = setup();
        let gold = material(10, i64::MAX);
        s.catalog.insert(s.tenant, gold.clone()).unwrap();
        let session = reviewed(s.tenant, &[(&gold, 12)]);

        let err = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap_err();

        assert!(matches!(
            err,
            PostingError::Domain(CountError::ValueOverflow(id)) if id == gold.id
        ));
        assert_eq!(s.catalog.get(s.tenant, gold.id).unwrap().unwrap().on_hand_quantity, 10);
        assert!(!s.ledger.is_posted(s.tenant, session.id_typed()).unwrap());
    }

    proptest! {
        #[test]
        fn posted_on_hand_matches_counts(
            counts in prop::collection::vec((0i64..500, 0i64..500, 1i64..10_000), 1..8)
        ) {
            let s = setup();
            let materials: Vec<Material> = counts
                .iter()
                .map(|(on_hand, _, price)| material(*on_hand, *price))
                .collect();
            for m in &materials {
                s.catalog.insert(s.tenant, m.clone()).unwrap();
            }
            let lines: Vec<(&Material, i64)> = materials
                .iter()
                .zip(&counts)
                .map(|(m, (_, counted, _))| (m, *counted))
                .collect();
            let session = reviewed(s.tenant, &lines);

            let receipt = s.engine.post(s.tenant, &session, "lee", Utc::now()).unwrap();

            for (m, counted) in &lines {
                let on_hand = s.catalog.get(s.tenant, m.id).unwrap().unwrap().on_hand_quantity;
                prop_assert_eq!(on_hand, *counted);
            }
            let changed = lines.iter().filter(|(m, c)| m.on_hand_quantity != *c).count();
            prop_assert_eq!(receipt.entries.len(), changed);
            let net: i64 = receipt.entries.iter().map(|e| e.value_delta_cents).sum();
            prop_assert_eq!(receipt.summary.net_value_cents(), net);
        }
    }
}
