use chrono::{Datelike, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};

use facilityops_core::{DomainError, ValueObject};

const PREFIX: &str = "CNT";

/// Human-readable session number, `CNT-YYMMDD-###`.
///
/// The suffix is random, so two sessions opened on the same day collide with
/// probability 1/1000. This is a display label only; `CountSessionId` is the
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionNumber(String);

impl ValueObject for SessionNumber {}

impl SessionNumber {
    pub fn generate<R: Rng>(date: NaiveDate, rng: &mut R) -> Self {
        Self::from_parts(date, rng.gen_range(0..1000))
    }

    /// Build from a date and a 0..=999 suffix (values above wrap).
    pub fn from_parts(date: NaiveDate, suffix: u16) -> Self {
        Self(format!(
            "{PREFIX}-{:02}{:02}{:02}-{:03}",
            date.year().rem_euclid(100),
            date.month(),
            date.day(),
            suffix % 1000
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SessionNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for SessionNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || DomainError::validation(format!("session number '{s}' is not CNT-YYMMDD-###"));

        let mut parts = s.split('-');
        let (Some(prefix), Some(date), Some(suffix), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let all_digits =
            |p: &str, len: usize| p.len() == len && p.bytes().all(|b| b.is_ascii_digit());
        if prefix != PREFIX || !all_digits(date, 6) || !all_digits(suffix, 3) {
            return Err(invalid());
        }
        NaiveDate::parse_from_str(date, "%y%m%d").map_err(|_| invalid())?;

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SessionNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionNumber> for String {
    fn from(value: SessionNumber) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    #[test]
    fn formats_date_and_zero_padded_suffix() {
        assert_eq!(SessionNumber::from_parts(date(), 7).as_str(), "CNT-240307-007");
    }

    #[test]
    fn generated_numbers_parse_back() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let number = SessionNumber::generate(date(), &mut rng);
            assert!(number.as_str().starts_with("CNT-240307-"));
            assert_eq!(number.as_str().parse::<SessionNumber>().unwrap(), number);
        }
    }

    #[test]
    fn rejects_malformed_numbers() {
        for bad in [
            "CNT-240307",
            "PO-240307-001",
            "CNT-241332-001",
            "CNT-240307-01",
            "CNT-240307-001-x",
        ] {
            assert!(bad.parse::<SessionNumber>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let ok: SessionNumber = serde_json::from_str("\"CNT-240307-123\"").unwrap();
        assert_eq!(ok.to_string(), "CNT-240307-123");
        assert!(serde_json::from_str::<SessionNumber>("\"CNT-nope\"").is_err());
    }
}
