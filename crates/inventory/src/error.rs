use thiserror::Error;

use facilityops_core::DomainError;

use crate::material::MaterialId;
use crate::session::CountSessionStatus;

/// Count-session failures.
///
/// The first group are user-correctable validation errors; the rest indicate
/// misuse of the workflow (calling an operation the current state forbids).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CountError {
    #[error("select at least one material to count")]
    EmptySelection,

    #[error("{0} variance(s) require approval")]
    UnapprovedVariances(usize),

    #[error("{0} variance(s) above 10% require a reason code")]
    MissingReasons(usize),

    #[error("material {0} is not part of this count session")]
    UnknownMaterial(MaterialId),

    #[error("material {0} has not been counted yet")]
    NotCounted(MaterialId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("count session is already posted")]
    AlreadyPosted,

    #[error("count session is being posted and cannot change")]
    PostingInProgress,

    #[error("value of the adjustment to material {0} overflows")]
    ValueOverflow(MaterialId),

    #[error("count session is {0:?} and can no longer change")]
    SessionClosed(CountSessionStatus),

    #[error("cannot {action} while count session is {from:?}")]
    InvalidTransition {
        from: CountSessionStatus,
        action: &'static str,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("count session not found")]
    NotFound,
}

impl CountError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// True for errors the user fixes by changing their input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CountError::EmptySelection
                | CountError::UnapprovedVariances(_)
                | CountError::MissingReasons(_)
                | CountError::UnknownMaterial(_)
                | CountError::NotCounted(_)
                | CountError::Validation(_)
        )
    }
}

impl From<DomainError> for CountError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                CountError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) | DomainError::Conflict(msg) => {
                CountError::InvariantViolation(msg)
            }
            DomainError::NotFound => CountError::NotFound,
        }
    }
}
