use serde::{Deserialize, Serialize};

use facilityops_core::AggregateId;

/// Material identifier (catalog record id, tenant-scoped by the catalog).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(pub AggregateId);

impl MaterialId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for MaterialId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Item master record as supplied by the materials catalog.
///
/// Read-only to the count workflow. `on_hand_quantity` changes only through
/// the catalog's write path, and every change bumps `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: MaterialId,
    pub name: String,
    pub sku: String,
    pub material_number: String,
    pub department_code: String,
    pub location: Option<String>,
    pub category: Option<String>,
    pub unit_of_measure: String,
    /// Unit price in smallest currency unit (e.g. cents).
    pub unit_price_cents: i64,
    pub on_hand_quantity: i64,
    pub version: u64,
}

impl Material {
    /// Point-in-time copy of the fields a count line needs.
    pub fn snapshot(&self) -> MaterialSnapshot {
        MaterialSnapshot {
            material_id: self.id,
            name: self.name.clone(),
            sku: self.sku.clone(),
            unit_of_measure: self.unit_of_measure.clone(),
            on_hand_quantity: self.on_hand_quantity,
        }
    }
}

/// Catalog state captured when counting starts.
///
/// `on_hand_quantity` becomes the line's `system_quantity` and is never
/// re-read, so the variance measures the count against a fixed baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialSnapshot {
    pub material_id: MaterialId,
    pub name: String,
    pub sku: String,
    pub unit_of_measure: String,
    pub on_hand_quantity: i64,
}
