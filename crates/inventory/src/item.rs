use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use facilityops_core::Entity;

use crate::material::{MaterialId, MaterialSnapshot};
use crate::variance::{VarianceClass, VarianceOutcome, compute_variance};

/// Why a counted quantity differs from the system quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Damaged,
    Theft,
    Expired,
    CycleCountError,
    ReceivingError,
    IssueError,
    UnitOfMeasureError,
    Other,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 8] = [
        ReasonCode::Damaged,
        ReasonCode::Theft,
        ReasonCode::Expired,
        ReasonCode::CycleCountError,
        ReasonCode::ReceivingError,
        ReasonCode::IssueError,
        ReasonCode::UnitOfMeasureError,
        ReasonCode::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ReasonCode::Damaged => "Damaged",
            ReasonCode::Theft => "Theft / loss",
            ReasonCode::Expired => "Expired / obsolete",
            ReasonCode::CycleCountError => "Previous count error",
            ReasonCode::ReceivingError => "Receiving error",
            ReasonCode::IssueError => "Issue error",
            ReasonCode::UnitOfMeasureError => "Unit of measure error",
            ReasonCode::Other => "Other",
        }
    }
}

/// One line of a count session, one per selected material.
///
/// `variance` and `variance_percent` are derived and only ever written by
/// [`CountItem::record_count`], which keeps them consistent with
/// `counted_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountItem {
    pub material_id: MaterialId,
    pub material_name: String,
    pub material_sku: String,
    pub unit_of_measure: String,
    /// On-hand quantity when counting started.
    pub system_quantity: i64,
    pub counted_quantity: Option<i64>,
    pub variance: i64,
    pub variance_percent: i64,
    pub reason_code: Option<ReasonCode>,
    pub notes: String,
    pub approved: bool,
    pub counted_by: Option<String>,
    pub counted_at: Option<DateTime<Utc>>,
}

impl CountItem {
    pub fn from_snapshot(snapshot: &MaterialSnapshot) -> Self {
        Self {
            material_id: snapshot.material_id,
            material_name: snapshot.name.clone(),
            material_sku: snapshot.sku.clone(),
            unit_of_measure: snapshot.unit_of_measure.clone(),
            system_quantity: snapshot.on_hand_quantity,
            counted_quantity: None,
            variance: 0,
            variance_percent: 0,
            reason_code: None,
            notes: String::new(),
            approved: false,
            counted_by: None,
            counted_at: None,
        }
    }

    pub fn is_counted(&self) -> bool {
        self.counted_quantity.is_some()
    }

    /// Counted and different from the system quantity.
    pub fn has_variance(&self) -> bool {
        self.is_counted() && self.variance != 0
    }

    pub fn outcome(&self) -> VarianceOutcome {
        VarianceOutcome {
            variance: self.variance,
            variance_percent: self.variance_percent,
        }
    }

    pub fn class(&self) -> VarianceClass {
        self.outcome().class()
    }

    /// Set (or clear) the count and recompute derived fields.
    ///
    /// A changed quantity invalidates any earlier approval; an unchanged one
    /// keeps it.
    pub(crate) fn record_count(
        &mut self,
        counted_quantity: Option<i64>,
        counted_by: &str,
        counted_at: DateTime<Utc>,
    ) {
        if self.counted_quantity != counted_quantity {
            self.approved = false;
        }

        let outcome = compute_variance(self.system_quantity, counted_quantity);
        self.counted_quantity = counted_quantity;
        self.variance = outcome.variance;
        self.variance_percent = outcome.variance_percent;

        match counted_quantity {
            Some(_) => {
                self.counted_by = Some(counted_by.to_string());
                self.counted_at = Some(counted_at);
            }
            None => {
                self.approved = false;
                self.counted_by = None;
                self.counted_at = None;
            }
        }
    }
}

impl Entity for CountItem {
    type Id = MaterialId;

    fn id(&self) -> &Self::Id {
        &self.material_id
    }
}
