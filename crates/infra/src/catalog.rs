//! Materials catalog boundary.
//!
//! The catalog owns `on_hand_quantity`. Count sessions read it (snapshot at
//! selection, fresh read at posting); the posting engine is the only
//! count-side writer, and it writes through version-checked adjustments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use facilityops_core::{ExpectedVersion, TenantId};
use facilityops_inventory::{ItemSelector, Material, MaterialId, MaterialQuery};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("material {0} not found")]
    NotFound(MaterialId),

    #[error("material {0} already exists")]
    Duplicate(MaterialId),

    #[error("material {material_id} changed concurrently (expected {expected:?}, found {actual})")]
    Conflict {
        material_id: MaterialId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("adjusting material {material_id} by {delta} would leave negative on-hand ({on_hand})")]
    NegativeOnHand {
        material_id: MaterialId,
        on_hand: i64,
        delta: i64,
    },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("failed to roll back adjustment of material {material_id}: {reason}")]
    CompensationFailed { material_id: MaterialId, reason: String },

    #[error("catalog storage error: {0}")]
    Storage(String),
}

/// A version-checked change to one material's on-hand quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnHandAdjustment {
    pub material_id: MaterialId,
    pub expected_version: ExpectedVersion,
    pub delta: i64,
}

/// Result of an applied adjustment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedAdjustment {
    pub material_id: MaterialId,
    pub delta: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    /// Material version after the write.
    pub version: u64,
    pub unit_price_cents: i64,
}

pub trait MaterialCatalog: Send + Sync {
    fn get(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<Material>, CatalogError>;

    /// Materials matching `query`, ordered by name then SKU.
    fn search(
        &self,
        tenant_id: TenantId,
        query: &MaterialQuery,
    ) -> Result<Vec<Material>, CatalogError>;

    /// Apply one adjustment as a compare-and-swap on the material's version.
    fn adjust_on_hand(
        &self,
        tenant_id: TenantId,
        adjustment: &OnHandAdjustment,
    ) -> Result<AppliedAdjustment, CatalogError>;

    /// Apply every adjustment or none of them.
    ///
    /// The default applies one at a time and, on the first failure, reverts
    /// what was already applied (newest first) before returning that failure.
    /// Stores with multi-row transactions should override it.
    fn apply_batch(
        &self,
        tenant_id: TenantId,
        adjustments: &[OnHandAdjustment],
    ) -> Result<Vec<AppliedAdjustment>, CatalogError> {
        let mut applied = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            match self.adjust_on_hand(tenant_id, adjustment) {
                Ok(done) => applied.push(done),
                Err(err) => {
                    tracing::warn!(
                        material_id = %adjustment.material_id,
                        applied = applied.len(),
                        error = %err,
                        "catalog batch failed; compensating applied adjustments"
                    );
                    self.revert(tenant_id, &applied)?;
                    return Err(err);
                }
            }
        }
        Ok(applied)
    }

    /// Undo applied adjustments, newest first.
    ///
    /// Reversals are unconditional deltas so movements that landed in between
    /// are preserved.
    fn revert(
        &self,
        tenant_id: TenantId,
        applied: &[AppliedAdjustment],
    ) -> Result<(), CatalogError> {
        for done in applied.iter().rev() {
            let reversal = OnHandAdjustment {
                material_id: done.material_id,
                expected_version: ExpectedVersion::Any,
                delta: -done.delta,
            };
            self.adjust_on_hand(tenant_id, &reversal).map_err(|err| {
                tracing::error!(
                    material_id = %done.material_id,
                    error = %err,
                    "compensation failed"
                );
                CatalogError::CompensationFailed {
                    material_id: done.material_id,
                    reason: err.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

impl<C> MaterialCatalog for Arc<C>
where
    C: MaterialCatalog + ?Sized,
{
    fn get(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<Material>, CatalogError> {
        (**self).get(tenant_id, material_id)
    }

    fn search(
        &self,
        tenant_id: TenantId,
        query: &MaterialQuery,
    ) -> Result<Vec<Material>, CatalogError> {
        (**self).search(tenant_id, query)
    }

    fn adjust_on_hand(
        &self,
        tenant_id: TenantId,
        adjustment: &OnHandAdjustment,
    ) -> Result<AppliedAdjustment, CatalogError> {
        (**self).adjust_on_hand(tenant_id, adjustment)
    }

    fn apply_batch(
        &self,
        tenant_id: TenantId,
        adjustments: &[OnHandAdjustment],
    ) -> Result<Vec<AppliedAdjustment>, CatalogError> {
        (**self).apply_batch(tenant_id, adjustments)
    }

    fn revert(
        &self,
        tenant_id: TenantId,
        applied: &[AppliedAdjustment],
    ) -> Result<(), CatalogError> {
        (**self).revert(tenant_id, applied)
    }
}

type CatalogKey = (TenantId, MaterialId);

/// In-memory, tenant-scoped catalog (tests/dev).
///
/// `apply_batch` runs under a single write lock, so readers never observe a
/// partially applied batch.
#[derive(Debug, Default)]
pub struct InMemoryMaterialCatalog {
    materials: RwLock<HashMap<CatalogKey, Material>>,
}

impl InMemoryMaterialCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: TenantId, material: Material) -> Result<(), CatalogError> {
        if material.on_hand_quantity < 0 {
            return Err(CatalogError::InvalidQuantity(
                "on-hand quantity cannot be negative".to_string(),
            ));
        }
        let mut materials = self.write()?;
        let key = (tenant_id, material.id);
        if materials.contains_key(&key) {
            return Err(CatalogError::Duplicate(material.id));
        }
        materials.insert(key, material);
        Ok(())
    }

    /// Goods receipt: increases on-hand outside any count session.
    pub fn receive(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
        quantity: i64,
    ) -> Result<AppliedAdjustment, CatalogError> {
        self.movement(tenant_id, material_id, quantity, 1)
    }

    /// Goods issue: decreases on-hand outside any count session.
    pub fn issue(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
        quantity: i64,
    ) -> Result<AppliedAdjustment, CatalogError> {
        self.movement(tenant_id, material_id, quantity, -1)
    }

    fn movement(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
        quantity: i64,
        sign: i64,
    ) -> Result<AppliedAdjustment, CatalogError> {
        if quantity <= 0 {
            return Err(CatalogError::InvalidQuantity(
                "movement quantity must be positive".to_string(),
            ));
        }
        self.adjust_on_hand(
            tenant_id,
            &OnHandAdjustment {
                material_id,
                expected_version: ExpectedVersion::Any,
                delta: sign * quantity,
            },
        )
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<CatalogKey, Material>>, CatalogError> {
        self.materials
            .read()
            .map_err(|_| CatalogError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<CatalogKey, Material>>, CatalogError> {
        self.materials
            .write()
            .map_err(|_| CatalogError::Storage("lock poisoned".to_string()))
    }
}

/// Check and apply one adjustment to a material record.
fn apply_to(
    material: &mut Material,
    adjustment: &OnHandAdjustment,
) -> Result<AppliedAdjustment, CatalogError> {
    if !adjustment.expected_version.matches(material.version) {
        return Err(CatalogError::Conflict {
            material_id: material.id,
            expected: adjustment.expected_version,
            actual: material.version,
        });
    }

    let new_quantity = material
        .on_hand_quantity
        .checked_add(adjustment.delta)
        .ok_or_else(|| CatalogError::InvalidQuantity("on-hand quantity overflow".to_string()))?;
    if new_quantity < 0 {
        return Err(CatalogError::NegativeOnHand {
            material_id: material.id,
            on_hand: material.on_hand_quantity,
            delta: adjustment.delta,
        });
    }

    let previous_quantity = material.on_hand_quantity;
    material.on_hand_quantity = new_quantity;
    material.version += 1;

    Ok(AppliedAdjustment {
        material_id: material.id,
        delta: adjustment.delta,
        previous_quantity,
        new_quantity,
        version: material.version,
        unit_price_cents: material.unit_price_cents,
    })
}

impl MaterialCatalog for InMemoryMaterialCatalog {
    fn get(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Option<Material>, CatalogError> {
        Ok(self.read()?.get(&(tenant_id, material_id)).cloned())
    }

    fn search(
        &self,
        tenant_id: TenantId,
        query: &MaterialQuery,
    ) -> Result<Vec<Material>, CatalogError> {
        let materials = self.read()?;
        let tenant_materials = materials
            .iter()
            .filter(|((tenant, _), _)| *tenant == tenant_id)
            .map(|(_, material)| material);
        Ok(ItemSelector::new(query.clone()).select(tenant_materials))
    }

    fn adjust_on_hand(
        &self,
        tenant_id: TenantId,
        adjustment: &OnHandAdjustment,
    ) -> Result<AppliedAdjustment, CatalogError> {
        let mut materials = self.write()?;
        let material = materials
            .get_mut(&(tenant_id, adjustment.material_id))
            .ok_or(CatalogError::NotFound(adjustment.material_id))?;
        apply_to(material, adjustment)
    }

    fn apply_batch(
        &self,
        tenant_id: TenantId,
        adjustments: &[OnHandAdjustment],
    ) -> Result<Vec<AppliedAdjustment>, CatalogError> {
        let mut materials = self.write()?;

        // Stage on copies; commit only if every adjustment succeeds.
        let mut staged: Vec<Material> = Vec::with_capacity(adjustments.len());
        let mut applied = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            let idx = match staged.iter().position(|m| m.id == adjustment.material_id) {
                Some(idx) => idx,
                None => {
                    let current = materials
                        .get(&(tenant_id, adjustment.material_id))
                        .cloned()
                        .ok_or(CatalogError::NotFound(adjustment.material_id))?;
                    staged.push(current);
                    staged.len() - 1
                }
            };
            applied.push(apply_to(&mut staged[idx], adjustment)?);
        }

        for material in staged {
            materials.insert((tenant_id, material.id), material);
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facilityops_core::AggregateId;
    use facilityops_inventory::ScopeFilter;

    fn material(name: &str, dept: &str, on_hand: i64) -> Material {
        Material {
            id: MaterialId::new(AggregateId::new()),
            name: name.to_string(),
            sku: name.to_uppercase(),
            material_number: format!("M-{name}"),
            department_code: dept.to_string(),
            location: None,
            category: None,
            unit_of_measure: "EA".to_string(),
            unit_price_cents: 250,
            on_hand_quantity: on_hand,
            version: 0,
        }
    }

    /// Exposes only the single-row operations, so `apply_batch` falls back to
    /// the trait's compensating implementation.
    struct RowByRow(InMemoryMaterialCatalog);

    impl MaterialCatalog for RowByRow {
        fn get(
            &self,
            tenant_id: TenantId,
            material_id: MaterialId,
        ) -> Result<Option<Material>, CatalogError> {
            self.0.get(tenant_id, material_id)
        }

        fn search(
            &self,
            tenant_id: TenantId,
            query: &MaterialQuery,
        ) -> Result<Vec<Material>, CatalogError> {
            self.0.search(tenant_id, query)
        }

        fn adjust_on_hand(
            &self,
            tenant_id: TenantId,
            adjustment: &OnHandAdjustment,
        ) -> Result<AppliedAdjustment, CatalogError> {
            self.0.adjust_on_hand(tenant_id, adjustment)
        }
    }

    #[test]
    fn search_is_tenant_scoped_and_filtered() {
        let catalog = InMemoryMaterialCatalog::new();
        let tenant = TenantId::new();
        catalog.insert(tenant, material("pump", "MAINT", 3)).unwrap();
        catalog.insert(tenant, material("filter", "HVAC", 8)).unwrap();
        catalog.insert(TenantId::new(), material("belt", "MAINT", 1)).unwrap();

        let query = MaterialQuery::for_scope(ScopeFilter::Department("maint".to_string()));
        let found = catalog.search(tenant, &query).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "pump");
    }

    #[test]
    fn stale_version_conflicts_and_changes_nothing() {
        let catalog = InMemoryMaterialCatalog::new();
        let tenant = TenantId::new();
        let m = material("pump", "MAINT", 10);
        let id = m.id;
        catalog.insert(tenant, m).unwrap();
        catalog.receive(tenant, id, 2).unwrap();

        let err = catalog
            .adjust_on_hand(
                tenant,
                &OnHandAdjustment {
                    material_id: id,
                    expected_version: ExpectedVersion::Exact(0),
                    delta: 5,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict { actual: 1, .. }));
        assert_eq!(catalog.get(tenant, id).unwrap().unwrap().on_hand_quantity, 12);
    }

    #[test]
    fn adjustments_serialize_with_their_version_expectation() {
        let adjustment = OnHandAdjustment {
            material_id: MaterialId::new(AggregateId::new()),
            expected_version: ExpectedVersion::Exact(7),
            delta: -3,
        };
        let json = serde_json::to_value(adjustment).unwrap();
        assert_eq!(json["expected_version"], serde_json::json!({ "Exact": 7 }));

        let back: OnHandAdjustment = serde_json::from_value(json).unwrap();
        assert_eq!(back, adjustment);

        let any: ExpectedVersion = serde_json::from_str(r#""Any""#).unwrap();
        assert_eq!(any, ExpectedVersion::Any);
    }

    #[test]
    fn issue_cannot_drive_on_hand_negative() {
        let catalog = InMemoryMaterialCatalog::new();
        let tenant = TenantId::new();
        let m = material("pump", "MAINT", 1);
        let id = m.id;
        catalog.insert(tenant, m).unwrap();

        assert!(matches!(
            catalog.issue(tenant, id, 2),
            Err(CatalogError::NegativeOnHand { .. })
        ));
        assert!(matches!(
            catalog.receive(tenant, id, 0),
            Err(CatalogError::InvalidQuantity(_))
        ));
    }

    fn batch_fixture() -> (TenantId, Vec<MaterialId>, Vec<OnHandAdjustment>) {
        let tenant = TenantId::new();
        let ids: Vec<MaterialId> = (0..3).map(|_| MaterialId::new(AggregateId::new())).collect();
        let at_zero = |material_id, delta| OnHandAdjustment {
            material_id,
            expected_version: ExpectedVersion::Exact(0),
            delta,
        };
        let adjustments = vec![
            at_zero(ids[0], 4),
            // Would go negative: the batch must fail here.
            at_zero(ids[1], -50),
            at_zero(ids[2], 1),
        ];
        (tenant, ids, adjustments)
    }

    fn seed(catalog: &InMemoryMaterialCatalog, tenant: TenantId, ids: &[MaterialId]) {
        for id in ids {
            let mut m = material("item", "MAINT", 10);
            m.id = *id;
            catalog.insert(tenant, m).unwrap();
        }
    }

    #[test]
    fn native_batch_is_all_or_nothing() {
        let catalog = InMemoryMaterialCatalog::new();
        let (tenant, ids, adjustments) = batch_fixture();
        seed(&catalog, tenant, &ids);

        assert!(matches!(
            catalog.apply_batch(tenant, &adjustments),
            Err(CatalogError::NegativeOnHand { .. })
        ));
        for id in &ids {
            let m = catalog.get(tenant, *id).unwrap().unwrap();
            assert_eq!((m.on_hand_quantity, m.version), (10, 0));
        }
    }

    #[test]
    fn compensating_batch_restores_applied_rows() {
        let inner = InMemoryMaterialCatalog::new();
        let (tenant, ids, adjustments) = batch_fixture();
        seed(&inner, tenant, &ids);
        let catalog = RowByRow(inner);

        assert!(matches!(
            catalog.apply_batch(tenant, &adjustments),
            Err(CatalogError::NegativeOnHand { .. })
        ));
        for id in &ids {
            assert_eq!(catalog.get(tenant, *id).unwrap().unwrap().on_hand_quantity, 10);
        }
    }
}
