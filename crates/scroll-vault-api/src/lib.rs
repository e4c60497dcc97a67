use std::path::{Path, PathBuf};

use scroll_vault_core::{
    ingest, resolve_limit, resolve_window, CycleDraft, CycleFilter, CyclePatch, CycleStats,
    IngestOrigin, IngestReceipt, MemoryCycle, ProvenanceEntry, StoreFault, VaultError,
    WindowAggregate, DEFAULT_LIST_LIMIT, DEFAULT_PROVENANCE_LIMIT, DEFAULT_SEARCH_LIMIT,
};
use scroll_vault_store_sqlite::{ArchiveExport, IntegrityReport, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultInfo {
    pub status: String,
    pub version: String,
    pub api_contract_version: String,
}

/// Entry point for every vault operation. Holds only the database path; each call
/// opens its own connection.
#[derive(Debug, Clone)]
pub struct ScrollVaultApi {
    db_path: PathBuf,
}

impl ScrollVaultApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn info() -> VaultInfo {
        VaultInfo {
            status: "Scroll Vault online".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_contract_version: API_CONTRACT_VERSION.to_string(),
        }
    }

    fn open_store(&self) -> Result<SqliteStore, VaultError> {
        let store = SqliteStore::open(&self.db_path).map_err(store_error)?;
        store.ensure_schema().map_err(store_error)?;
        Ok(store)
    }

    /// Deduplicating write with a provenance entry for every attempt.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] for malformed input and
    /// [`VaultError::StoreUnavailable`] when the store cannot complete the unit.
    pub fn ingest(
        &self,
        draft: &CycleDraft,
        origin: &IngestOrigin,
    ) -> Result<IngestReceipt, VaultError> {
        let mut store = self.open_store()?;
        ingest(&mut store, draft, origin)
    }

    /// Store one cycle without deduplication or provenance.
    ///
    /// # Errors
    /// Returns [`VaultError::UniquenessViolation`] when its hash or signifier is taken.
    pub fn create_cycle(&self, draft: &CycleDraft) -> Result<MemoryCycle, VaultError> {
        draft.validate()?;
        let mut store = self.open_store()?;
        let cycle = store.create_cycle(draft).map_err(store_error)?;
        tracing::info!(
            signifier = %cycle.signifier,
            cycle_hash = %cycle.cycle_hash,
            "cycle created"
        );
        Ok(cycle)
    }

    /// Store every draft or none of them.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when any draft is malformed and
    /// [`VaultError::UniquenessViolation`] when any draft collides.
    pub fn create_cycles(&self, drafts: &[CycleDraft]) -> Result<Vec<MemoryCycle>, VaultError> {
        for (index, draft) in drafts.iter().enumerate() {
            draft.validate().map_err(|err| match err {
                VaultError::Validation(message) => {
                    VaultError::Validation(format!("cycle {index}: {message}"))
                }
                other => other,
            })?;
        }
        let mut store = self.open_store()?;
        let created = store.create_cycles(drafts).map_err(store_error)?;
        tracing::info!(count = created.len(), "bulk cycles created");
        Ok(created)
    }

    /// # Errors
    /// Returns [`VaultError::NotFound`] when no cycle carries `signifier`.
    pub fn get_by_signifier(&self, signifier: &str) -> Result<MemoryCycle, VaultError> {
        self.open_store()?
            .find_by_signifier(signifier)
            .map_err(store_error)?
            .ok_or_else(|| VaultError::NotFound(format!("no cycle with signifier {signifier}")))
    }

    /// # Errors
    /// Returns [`VaultError::NotFound`] when no cycle carries `cycle_hash`.
    pub fn get_by_hash(&self, cycle_hash: &str) -> Result<MemoryCycle, VaultError> {
        self.open_store()?
            .find_by_hash(cycle_hash)
            .map_err(store_error)?
            .ok_or_else(|| VaultError::NotFound(format!("no cycle with hash {cycle_hash}")))
    }

    /// # Errors
    /// Returns [`VaultError::NotFound`] when the vault is empty.
    pub fn latest(&self) -> Result<MemoryCycle, VaultError> {
        self.open_store()?
            .latest_cycle()
            .map_err(store_error)?
            .ok_or_else(|| VaultError::NotFound("vault holds no cycles".to_string()))
    }

    /// # Errors
    /// Returns [`VaultError::Validation`] when `limit` is out of range.
    pub fn list(&self, limit: Option<u32>) -> Result<Vec<MemoryCycle>, VaultError> {
        let limit = resolve_limit(limit, DEFAULT_LIST_LIMIT)?;
        self.open_store()?.list_cycles(limit).map_err(store_error)
    }

    /// Replace `echo_state` and `xi`; the stored hash is unchanged.
    ///
    /// # Errors
    /// Returns [`VaultError::NotFound`] when no cycle carries `signifier`.
    pub fn patch(&self, signifier: &str, patch: &CyclePatch) -> Result<MemoryCycle, VaultError> {
        let mut store = self.open_store()?;
        let patched = store
            .patch_cycle(signifier, patch)
            .map_err(store_error)?
            .ok_or_else(|| VaultError::NotFound(format!("no cycle with signifier {signifier}")))?;
        tracing::info!(signifier = %patched.signifier, xi = patched.xi, "cycle patched");
        Ok(patched)
    }

    /// # Errors
    /// Returns [`VaultError::StoreUnavailable`] when the store cannot be read.
    pub fn stats(&self) -> Result<CycleStats, VaultError> {
        self.open_store()?.stats().map_err(store_error)
    }

    /// # Errors
    /// Returns [`VaultError::Validation`] when a bound is not finite or the limit is
    /// out of range.
    pub fn query(&self, filter: &CycleFilter) -> Result<Vec<MemoryCycle>, VaultError> {
        let limit = filter.validate()?;
        self.open_store()?.query_cycles(filter, limit).map_err(store_error)
    }

    /// # Errors
    /// Returns [`VaultError::Validation`] when `window` is below one or `limit` is out
    /// of range.
    pub fn aggregate(
        &self,
        window: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<WindowAggregate>, VaultError> {
        let window = resolve_window(window)?;
        let limit = resolve_limit(limit, DEFAULT_LIST_LIMIT)?;
        self.open_store()?.aggregate_windows(window, limit).map_err(store_error)
    }

    /// # Errors
    /// Returns [`VaultError::Validation`] when `keyword` is blank or `limit` is out of
    /// range.
    pub fn search(
        &self,
        keyword: &str,
        limit: Option<u32>,
    ) -> Result<Vec<MemoryCycle>, VaultError> {
        if keyword.trim().is_empty() {
            return Err(VaultError::Validation("keyword MUST be non-empty".to_string()));
        }
        let limit = resolve_limit(limit, DEFAULT_SEARCH_LIMIT)?;
        self.open_store()?.search_cycles(keyword, limit).map_err(store_error)
    }

    /// # Errors
    /// Returns [`VaultError::StoreUnavailable`] when the vault cannot be read or compressed.
    pub fn export_archive(&self) -> Result<ArchiveExport, VaultError> {
        let export = self.open_store()?.export_archive().map_err(store_error)?;
        tracing::info!(records = export.records, file_name = %export.file_name, "archive exported");
        Ok(export)
    }

    /// # Errors
    /// Returns [`VaultError::Validation`] when `limit` is out of range.
    pub fn provenance(&self, limit: Option<u32>) -> Result<Vec<ProvenanceEntry>, VaultError> {
        let limit = resolve_limit(limit, DEFAULT_PROVENANCE_LIMIT)?;
        self.open_store()?.list_provenance(limit).map_err(store_error)
    }

    /// # Errors
    /// Returns [`VaultError::StoreUnavailable`] when an integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, VaultError> {
        self.open_store()?.integrity_check().map_err(store_error)
    }
}

/// Map a store error onto the vault taxonomy, keeping a typed fault when one is
/// present in the cause chain.
fn store_error(err: anyhow::Error) -> VaultError {
    match err.chain().find_map(|cause| cause.downcast_ref::<StoreFault>()) {
        Some(fault) => {
            tracing::warn!(error = %format!("{err:#}"), "store fault");
            VaultError::from(fault.clone())
        }
        None => {
            tracing::error!(error = %format!("{err:#}"), "store unavailable");
            VaultError::StoreUnavailable(format!("{err:#}"))
        }
    }
}
