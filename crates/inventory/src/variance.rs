//! Variance engine: counted vs. system quantity.
//!
//! Pure arithmetic, no state. Percentages are whole numbers rounded half away
//! from zero using exact integer math, so `(3, 4)` is always 33 and never
//! 33.000000004.

use serde::{Deserialize, Serialize};

use facilityops_core::ValueObject;

/// Upper bound (inclusive) of `|variance_percent|` for a minor variance.
pub const MINOR_VARIANCE_PERCENT: i64 = 5;

/// A count against a zero baseline is a full overage, not an infinite one.
const ZERO_BASELINE_OVERAGE_PERCENT: i64 = 100;

/// Derived variance fields of one count line.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarianceOutcome {
    pub variance: i64,
    pub variance_percent: i64,
}

impl ValueObject for VarianceOutcome {}

impl VarianceOutcome {
    pub fn class(&self) -> VarianceClass {
        VarianceClass::of(self.variance, self.variance_percent)
    }
}

/// Display classification of a variance. Carries no gating logic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceClass {
    Match,
    Minor,
    Significant,
}

impl VarianceClass {
    /// Classify a variance.
    ///
    /// A non-zero variance whose percentage rounds to 0 (tiny drift on a large
    /// baseline) is `Minor`, not `Match`: only an exact count matches.
    pub fn of(variance: i64, variance_percent: i64) -> Self {
        if variance == 0 {
            VarianceClass::Match
        } else if variance_percent.abs() <= MINOR_VARIANCE_PERCENT {
            VarianceClass::Minor
        } else {
            VarianceClass::Significant
        }
    }
}

/// Compute `(variance, variance_percent)` for a count line.
///
/// An uncounted line (`counted == None`) yields `(0, 0)`.
pub fn compute_variance(system_quantity: i64, counted_quantity: Option<i64>) -> VarianceOutcome {
    let Some(counted) = counted_quantity else {
        return VarianceOutcome::default();
    };

    let variance = counted - system_quantity;
    let variance_percent = if system_quantity == 0 {
        if counted > 0 { ZERO_BASELINE_OVERAGE_PERCENT } else { 0 }
    } else {
        rounded_percent(variance, system_quantity.abs())
    };

    VarianceOutcome {
        variance,
        variance_percent,
    }
}

/// `round(numerator / denominator * 100)`, half away from zero. `denominator > 0`.
fn rounded_percent(numerator: i64, denominator: i64) -> i64 {
    let scaled = i128::from(numerator) * 100;
    let denominator = i128::from(denominator);

    let quotient = scaled / denominator;
    let remainder = scaled % denominator;

    let rounded = if remainder.abs() * 2 >= denominator {
        quotient + scaled.signum()
    } else {
        quotient
    };

    i64::try_from(rounded).unwrap_or(if rounded.is_negative() { i64::MIN } else { i64::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn uncounted_line_has_no_variance() {
        assert_eq!(compute_variance(100, None), VarianceOutcome::default());
    }

    #[test]
    fn shortage_is_negative() {
        let v = compute_variance(100, Some(95));
        assert_eq!(v.variance, -5);
        assert_eq!(v.variance_percent, -5);
        assert_eq!(v.class(), VarianceClass::Minor);
    }

    #[test]
    fn count_against_zero_baseline_is_full_overage() {
        let v = compute_variance(0, Some(5));
        assert_eq!(v.variance, 5);
        assert_eq!(v.variance_percent, 100);
    }

    #[test]
    fn zero_against_zero_is_a_match() {
        let v = compute_variance(0, Some(0));
        assert_eq!(v, VarianceOutcome::default());
        assert_eq!(v.class(), VarianceClass::Match);
    }

    #[test]
    fn thirds_round_to_nearest_whole_percent() {
        assert_eq!(compute_variance(3, Some(4)).variance_percent, 33);
        assert_eq!(compute_variance(3, Some(5)).variance_percent, 67);
        assert_eq!(compute_variance(3, Some(2)).variance_percent, -33);
    }

    #[test]
    fn halves_round_away_from_zero() {
        // 1/8 = 12.5%
        assert_eq!(compute_variance(8, Some(9)).variance_percent, 13);
        assert_eq!(compute_variance(8, Some(7)).variance_percent, -13);
        // 1/200 = 0.5%
        assert_eq!(compute_variance(200, Some(201)).variance_percent, 1);
    }

    #[test]
    fn tiny_drift_on_large_baseline_is_minor_not_match() {
        let v = compute_variance(1_000, Some(1_001));
        assert_eq!(v.variance_percent, 0);
        assert_eq!(v.class(), VarianceClass::Minor);
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(VarianceClass::of(5, 5), VarianceClass::Minor);
        assert_eq!(VarianceClass::of(-5, -5), VarianceClass::Minor);
        assert_eq!(VarianceClass::of(6, 6), VarianceClass::Significant);
        assert_eq!(VarianceClass::of(-15, -15), VarianceClass::Significant);
    }

    proptest! {
        /// Property: variance is always counted - system for a counted line.
        #[test]
        fn variance_is_counted_minus_system(
            system in 0i64..1_000_000,
            counted in 0i64..1_000_000,
        ) {
            let v = compute_variance(system, Some(counted));
            prop_assert_eq!(v.variance, counted - system);
            prop_assert_eq!(v.variance == 0, v.class() == VarianceClass::Match);
        }

        /// Property: the percentage sign follows the variance sign, and a
        /// shortage never exceeds -100%.
        #[test]
        fn percent_sign_follows_variance(
            system in 1i64..1_000_000,
            counted in 0i64..1_000_000,
        ) {
            let v = compute_variance(system, Some(counted));
            prop_assert!(
                v.variance_percent.signum() == v.variance.signum() || v.variance_percent == 0
            );
            prop_assert!(v.variance_percent >= -100);
        }
    }
}
