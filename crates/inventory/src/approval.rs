//! Approval gate: decides whether a reviewed session may be posted.
//!
//! Only counted lines with a non-zero variance are gated. Uncounted lines are
//! not errors; they are simply left out of posting.

use serde::{Deserialize, Serialize};

use crate::error::CountError;
use crate::item::CountItem;
use crate::material::MaterialId;

/// Lines whose `|variance_percent|` exceeds this need a reason code.
pub const REASON_REQUIRED_ABOVE_PERCENT: i64 = 10;

/// Which lines block posting, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReport {
    /// Lines with a variance.
    pub variant_items: usize,
    pub unapproved: Vec<MaterialId>,
    pub missing_reasons: Vec<MaterialId>,
}

impl ApprovalReport {
    pub fn is_clear(&self) -> bool {
        self.unapproved.is_empty() && self.missing_reasons.is_empty()
    }

    /// Convert to the first failing rule: approval before reasons.
    pub fn into_result(self) -> Result<(), CountError> {
        if !self.unapproved.is_empty() {
            return Err(CountError::UnapprovedVariances(self.unapproved.len()));
        }
        if !self.missing_reasons.is_empty() {
            return Err(CountError::MissingReasons(self.missing_reasons.len()));
        }
        Ok(())
    }
}

/// Stateless gate over a session's count lines.
#[derive(Debug, Copy, Clone, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    /// Lines in the variance set `V`.
    pub fn variant_items(items: &[CountItem]) -> impl Iterator<Item = &CountItem> {
        items.iter().filter(|item| item.has_variance())
    }

    pub fn needs_reason(item: &CountItem) -> bool {
        item.has_variance()
            && item.variance_percent.abs() > REASON_REQUIRED_ABOVE_PERCENT
            && item.reason_code.is_none()
    }

    pub fn report(items: &[CountItem]) -> ApprovalReport {
        let mut report = ApprovalReport::default();
        for item in Self::variant_items(items) {
            report.variant_items += 1;
            if !item.approved {
                report.unapproved.push(item.material_id);
            }
            if Self::needs_reason(item) {
                report.missing_reasons.push(item.material_id);
            }
        }
        report
    }

    pub fn evaluate(items: &[CountItem]) -> Result<(), CountError> {
        Self::report(items).into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ReasonCode;
    use crate::material::MaterialSnapshot;
    use chrono::Utc;
    use facilityops_core::AggregateId;

    fn counted(system: i64, counted: Option<i64>) -> CountItem {
        let mut item = CountItem::from_snapshot(&MaterialSnapshot {
            material_id: MaterialId::new(AggregateId::new()),
            name: "Fuse 20A".to_string(),
            sku: "FU-20".to_string(),
            unit_of_measure: "EA".to_string(),
            on_hand_quantity: system,
        });
        item.record_count(counted, "counter", Utc::now());
        item
    }

    #[test]
    fn unapproved_variance_blocks_posting() {
        let items = vec![counted(100, Some(90))];
        assert_eq!(ApprovalGate::evaluate(&items), Err(CountError::UnapprovedVariances(1)));
    }

    #[test]
    fn missing_reason_above_threshold_blocks_posting() {
        let mut item = counted(100, Some(85));
        assert_eq!(item.variance_percent, -15);
        item.approved = true;

        assert_eq!(ApprovalGate::evaluate(&[item.clone()]), Err(CountError::MissingReasons(1)));

        item.reason_code = Some(ReasonCode::Damaged);
        assert_eq!(ApprovalGate::evaluate(&[item]), Ok(()));
    }

    #[test]
    fn reason_is_optional_at_or_below_threshold() {
        let mut eight = counted(100, Some(92));
        assert_eq!(eight.variance_percent, -8);
        eight.approved = true;

        let mut ten = counted(100, Some(110));
        ten.approved = true;

        assert_eq!(ApprovalGate::evaluate(&[eight, ten]), Ok(()));
    }

    #[test]
    fn matches_and_uncounted_lines_are_not_gated() {
        let items = vec![counted(50, Some(50)), counted(20, None)];
        let report = ApprovalGate::report(&items);
        assert_eq!(report.variant_items, 0);
        assert!(report.is_clear());
    }

    #[test]
    fn approval_rule_is_reported_before_reason_rule() {
        let items = vec![counted(100, Some(50)), counted(10, Some(11))];
        let report = ApprovalGate::report(&items);

        assert_eq!(report.unapproved.len(), 2);
        assert_eq!(report.missing_reasons.len(), 1);
        assert_eq!(report.into_result(), Err(CountError::UnapprovedVariances(2)));
    }
}
