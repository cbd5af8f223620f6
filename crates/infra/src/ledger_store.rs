//! Inventory adjustment ledger storage.
//!
//! A session's entries are written in one call and never change afterwards.
//! The presence of a session's record is what makes posting idempotent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use facilityops_core::TenantId;
use facilityops_inventory::{CountSessionId, LedgerEntry, MaterialId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger already holds a posting for session {0}")]
    DuplicateSession(CountSessionId),

    #[error("ledger entry belongs to session {found}, expected {expected}")]
    ForeignEntry {
        expected: CountSessionId,
        found: CountSessionId,
    },

    #[error("ledger storage error: {0}")]
    Storage(String),
}

pub trait LedgerStore: Send + Sync {
    /// Record every entry of one posting. Fails if the session already has one.
    ///
    /// An empty `entries` still marks the session as posted.
    fn record(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        entries: Vec<LedgerEntry>,
    ) -> Result<(), LedgerError>;

    fn entries_for_session(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    fn is_posted(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<bool, LedgerError>;

    /// Adjustment history of one material across sessions.
    fn entries_for_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;
}

impl<L> LedgerStore for Arc<L>
where
    L: LedgerStore + ?Sized,
{
    fn record(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        entries: Vec<LedgerEntry>,
    ) -> Result<(), LedgerError> {
        (**self).record(tenant_id, session_id, entries)
    }

    fn entries_for_session(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).entries_for_session(tenant_id, session_id)
    }

    fn is_posted(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<bool, LedgerError> {
        (**self).is_posted(tenant_id, session_id)
    }

    fn entries_for_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).entries_for_material(tenant_id, material_id)
    }
}

/// In-memory ledger (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    postings: RwLock<HashMap<(TenantId, CountSessionId), Vec<LedgerEntry>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all sessions of a tenant.
    pub fn entry_count(&self, tenant_id: TenantId) -> Result<usize, LedgerError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(postings
            .iter()
            .filter(|((tenant, _), _)| *tenant == tenant_id)
            .map(|(_, entries)| entries.len())
            .sum())
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn record(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
        entries: Vec<LedgerEntry>,
    ) -> Result<(), LedgerError> {
        if let Some(foreign) = entries.iter().find(|e| e.session_id != session_id) {
            return Err(LedgerError::ForeignEntry {
                expected: session_id,
                found: foreign.session_id,
            });
        }

        let mut postings = self
            .postings
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;

        let key = (tenant_id, session_id);
        if postings.contains_key(&key) {
            return Err(LedgerError::DuplicateSession(session_id));
        }
        postings.insert(key, entries);
        Ok(())
    }

    fn entries_for_session(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(postings.get(&(tenant_id, session_id)).cloned().unwrap_or_default())
    }

    fn is_posted(
        &self,
        tenant_id: TenantId,
        session_id: CountSessionId,
    ) -> Result<bool, LedgerError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(postings.contains_key(&(tenant_id, session_id)))
    }

    fn entries_for_material(
        &self,
        tenant_id: TenantId,
        material_id: MaterialId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        let mut entries: Vec<LedgerEntry> = postings
            .iter()
            .filter(|((tenant, _), _)| *tenant == tenant_id)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|e| e.material_id == material_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.posted_at);
        Ok(entries)
    }
}
