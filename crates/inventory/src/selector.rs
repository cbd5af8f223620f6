//! Item selector: narrows the catalog to the candidate set for a new session.

use serde::{Deserialize, Serialize};

use crate::material::Material;

/// Which slice of the catalog a session counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScopeFilter {
    #[default]
    All,
    Department(String),
    Location(String),
    Category(String),
}

impl ScopeFilter {
    pub fn matches(&self, material: &Material) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Department(code) => material.department_code.eq_ignore_ascii_case(code),
            ScopeFilter::Location(location) => material
                .location
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(location)),
            ScopeFilter::Category(category) => material
                .category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(category)),
        }
    }
}

/// Catalog query: a scope plus an optional free-text term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialQuery {
    pub scope: ScopeFilter,
    /// Case-insensitive substring over SKU, name, and material number.
    pub search: Option<String>,
}

impl MaterialQuery {
    pub fn for_scope(scope: ScopeFilter) -> Self {
        Self {
            scope,
            search: None,
        }
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        let term = term.into();
        self.search = if term.trim().is_empty() {
            None
        } else {
            Some(term)
        };
        self
    }

    pub fn matches(&self, material: &Material) -> bool {
        self.scope.matches(material) && self.matches_search(material)
    }

    fn matches_search(&self, material: &Material) -> bool {
        let Some(term) = self.search.as_deref() else {
            return true;
        };
        let needle = term.trim().to_lowercase();
        [&material.sku, &material.name, &material.material_number]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Applies a [`MaterialQuery`] to a batch of catalog records.
#[derive(Debug, Clone, Default)]
pub struct ItemSelector {
    query: MaterialQuery,
}

impl ItemSelector {
    pub fn new(query: MaterialQuery) -> Self {
        Self { query }
    }

    pub fn query(&self) -> &MaterialQuery {
        &self.query
    }

    /// Matching materials, ordered by name then SKU.
    pub fn select<'a, I>(&self, materials: I) -> Vec<Material>
    where
        I: IntoIterator<Item = &'a Material>,
    {
        let mut selected: Vec<Material> = materials
            .into_iter()
            .filter(|m| self.query.matches(m))
            .cloned()
            .collect();
        selected.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.sku.cmp(&b.sku)));
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialId;
    use facilityops_core::AggregateId;

    fn material(
        name: &str,
        sku: &str,
        dept: &str,
        location: Option<&str>,
        category: Option<&str>,
    ) -> Material {
        Material {
            id: MaterialId::new(AggregateId::new()),
            name: name.to_string(),
            sku: sku.to_string(),
            material_number: format!("MAT-{sku}"),
            department_code: dept.to_string(),
            location: location.map(str::to_string),
            category: category.map(str::to_string),
            unit_of_measure: "EA".to_string(),
            unit_price_cents: 100,
            on_hand_quantity: 10,
            version: 1,
        }
    }

    fn catalog() -> Vec<Material> {
        vec![
            material("Pipe wrench", "PW-18", "MAINT", Some("Shop A"), Some("Tools")),
            material("Air filter", "AF-2020", "HVAC", Some("Cage 3"), Some("Filters")),
            material("Ball valve", "BV-050", "MAINT", None, Some("Plumbing")),
        ]
    }

    #[test]
    fn all_scope_returns_everything_sorted_by_name() {
        let selected = ItemSelector::default().select(&catalog());
        let names: Vec<_> = selected.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Air filter", "Ball valve", "Pipe wrench"]);
    }

    #[test]
    fn department_scope_filters_by_code() {
        let scope = ScopeFilter::Department("maint".into());
        let selector = ItemSelector::new(MaterialQuery::for_scope(scope));
        assert_eq!(selector.select(&catalog()).len(), 2);
    }

    #[test]
    fn location_scope_skips_materials_without_location() {
        let scope = ScopeFilter::Location("Shop A".into());
        let selector = ItemSelector::new(MaterialQuery::for_scope(scope));
        let selected = selector.select(&catalog());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].sku, "PW-18");
    }

    #[test]
    fn search_matches_sku_name_or_material_number() {
        let items = catalog();
        let by_sku = ItemSelector::new(MaterialQuery::default().with_search("af-20"));
        assert_eq!(by_sku.select(&items)[0].name, "Air filter");

        let by_name = ItemSelector::new(MaterialQuery::default().with_search("VALVE"));
        assert_eq!(by_name.select(&items)[0].sku, "BV-050");

        let by_number = ItemSelector::new(MaterialQuery::default().with_search("mat-pw"));
        assert_eq!(by_number.select(&items)[0].sku, "PW-18");
    }

    #[test]
    fn blank_search_is_ignored() {
        let query =
            MaterialQuery::for_scope(ScopeFilter::Category("Tools".into())).with_search("   ");
        assert_eq!(query.search, None);
        assert_eq!(ItemSelector::new(query).select(&catalog()).len(), 1);
    }
}
