//! Inventory adjustment ledger: what a posting writes and how it is summarised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use facilityops_core::ValueObject;

use crate::approval::ApprovalGate;
use crate::error::CountError;
use crate::item::CountItem;
use crate::material::MaterialId;
use crate::session::CountSessionId;

/// One applied adjustment. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub session_id: CountSessionId,
    pub material_id: MaterialId,
    /// Equals the line's variance.
    pub quantity_delta: i64,
    /// Unit price read from the catalog at posting time.
    pub unit_price_cents: i64,
    pub value_delta_cents: i64,
    pub posted_by: String,
    pub posted_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        session_id: CountSessionId,
        line: &PostingLine,
        unit_price_cents: i64,
        posted_by: impl Into<String>,
        posted_at: DateTime<Utc>,
    ) -> Result<Self, CountError> {
        let value_delta_cents = line
            .quantity_delta
            .checked_mul(unit_price_cents)
            .ok_or(CountError::ValueOverflow(line.material_id))?;
        Ok(Self {
            session_id,
            material_id: line.material_id,
            quantity_delta: line.quantity_delta,
            unit_price_cents,
            value_delta_cents,
            posted_by: posted_by.into(),
            posted_at,
        })
    }
}

/// A line of the posting set `P`: an approved, non-zero variance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingLine {
    pub material_id: MaterialId,
    pub quantity_delta: i64,
}

/// Build the posting set from a session's lines (counted, non-zero variance).
pub fn posting_set(items: &[CountItem]) -> Vec<PostingLine> {
    ApprovalGate::variant_items(items)
        .map(|item| PostingLine {
            material_id: item.material_id,
            quantity_delta: item.variance,
        })
        .collect()
}

/// Reporting totals for a posting. Derived, never stored as its own entity.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingSummary {
    pub adjusted_items: usize,
    pub positive_value_cents: i64,
    /// Magnitude of the negative adjustments (a positive number).
    pub negative_value_cents: i64,
}

impl ValueObject for PostingSummary {}

impl PostingSummary {
    /// Totals the entries; fails on the first entry that would overflow a sum.
    pub fn from_entries<'a, I>(entries: I) -> Result<Self, CountError>
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        entries.into_iter().try_fold(Self::default(), |mut acc, entry| {
            let overflow = CountError::ValueOverflow(entry.material_id);
            acc.adjusted_items += 1;
            if entry.value_delta_cents >= 0 {
                acc.positive_value_cents = acc
                    .positive_value_cents
                    .checked_add(entry.value_delta_cents)
                    .ok_or(overflow)?;
            } else {
                acc.negative_value_cents = entry
                    .value_delta_cents
                    .checked_abs()
                    .and_then(|magnitude| acc.negative_value_cents.checked_add(magnitude))
                    .ok_or(overflow)?;
            }
            Ok(acc)
        })
    }

    pub fn net_value_cents(&self) -> i64 {
        self.positive_value_cents - self.negative_value_cents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facilityops_core::AggregateId;
    use proptest::prelude::*;

    fn entry(quantity_delta: i64, unit_price_cents: i64) -> LedgerEntry {
        let line = PostingLine {
            material_id: MaterialId::new(AggregateId::new()),
            quantity_delta,
        };
        LedgerEntry::new(
            CountSessionId::new(AggregateId::new()),
            &line,
            unit_price_cents,
            "supervisor",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn value_delta_uses_posting_time_price() {
        let e = entry(-4, 1_250);
        assert_eq!(e.value_delta_cents, -5_000);
    }

    #[test]
    fn summary_splits_positive_and_negative_value() {
        let entries = vec![entry(5, 200), entry(-3, 1_000), entry(2, 50)];
        let summary = PostingSummary::from_entries(&entries).unwrap();

        assert_eq!(summary.adjusted_items, 3);
        assert_eq!(summary.positive_value_cents, 1_100);
        assert_eq!(summary.negative_value_cents, 3_000);
        assert_eq!(summary.net_value_cents(), -1_900);
    }

    #[test]
    fn value_delta_overflow_is_reported() {
        let line = PostingLine {
            material_id: MaterialId::new(AggregateId::new()),
            quantity_delta: i64::MAX / 2,
        };
        let err = LedgerEntry::new(
            CountSessionId::new(AggregateId::new()),
            &line,
            3,
            "supervisor",
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, CountError::ValueOverflow(line.material_id));
    }

    #[test]
    fn summary_overflow_names_the_entry() {
        let first = entry(i64::MAX, 1);
        let second = entry(1, 1);
        let err = PostingSummary::from_entries([&first, &second]).unwrap_err();
        assert_eq!(err, CountError::ValueOverflow(second.material_id));

        let low = entry(i64::MIN, 1);
        let err = PostingSummary::from_entries([&low]).unwrap_err();
        assert_eq!(err, CountError::ValueOverflow(low.material_id));
    }

    proptest! {
        /// Property: net value equals the signed sum of value deltas.
        #[test]
        fn net_value_is_signed_sum(
            deltas in prop::collection::vec((-1_000i64..1_000, 0i64..100_000), 0..20)
        ) {
            let entries: Vec<LedgerEntry> = deltas.iter().map(|(q, p)| entry(*q, *p)).collect();
            let summary = PostingSummary::from_entries(&entries).unwrap();
            let signed: i64 = entries.iter().map(|e| e.value_delta_cents).sum();

            prop_assert_eq!(summary.net_value_cents(), signed);
            prop_assert_eq!(summary.adjusted_items, entries.len());
            prop_assert!(summary.negative_value_cents >= 0);
        }
    }
}
