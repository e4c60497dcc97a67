use serde::{Deserialize, Serialize};

use crate::{
    CycleDraft, IngestEvent, MemoryCycle, ProvenanceDraft, ProvenanceEntry, StoreFault,
    UniqueKey, VaultError,
};

/// Store operations available inside one unit of work.
pub trait CycleTx {
    /// # Errors
    /// Returns a [`StoreFault`] when the lookup cannot be completed.
    fn find_by_hash(&self, cycle_hash: &str) -> Result<Option<MemoryCycle>, StoreFault>;

    /// # Errors
    /// Returns a [`StoreFault`] when the lookup cannot be completed.
    fn find_by_signifier(&self, signifier: &str) -> Result<Option<MemoryCycle>, StoreFault>;

    /// Insert a new cycle carrying `cycle_hash`.
    ///
    /// # Errors
    /// Returns [`StoreFault::Unique`] when the hash or signifier is already stored.
    fn insert_cycle(&self, draft: &CycleDraft, cycle_hash: &str)
        -> Result<MemoryCycle, StoreFault>;

    /// # Errors
    /// Returns a [`StoreFault`] when the entry cannot be written.
    fn append_provenance(&self, entry: &ProvenanceDraft) -> Result<ProvenanceEntry, StoreFault>;
}

/// A store that can run work as one transaction.
pub trait CycleLedger {
    /// Run `work` as one unit: commit when it returns `Ok`, roll back otherwise.
    ///
    /// # Errors
    /// Returns the fault raised by `work`, or by beginning or committing the unit.
    fn transact<T, F>(&mut self, work: F) -> Result<T, StoreFault>
    where
        F: FnOnce(&dyn CycleTx) -> Result<T, StoreFault>;
}

/// Where an ingest call came from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestOrigin {
    pub source_address: String,
    pub node_id: Option<String>,
}

impl IngestOrigin {
    /// Build an origin; a blank node label is treated as absent.
    #[must_use]
    pub fn new(source_address: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            source_address: source_address.into(),
            node_id: node_id.filter(|node_id| !node_id.trim().is_empty()),
        }
    }

    fn validate(&self) -> Result<(), VaultError> {
        if self.source_address.trim().is_empty() {
            return Err(VaultError::Validation("source_address MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReceipt {
    pub cycle: MemoryCycle,
    pub created: bool,
    pub provenance: ProvenanceEntry,
}

/// Store `draft` at most once and record the attempt in the provenance log.
///
/// A draft whose hash or signifier is already stored resolves to the stored record
/// and is logged as `duplicate_ingest`. An insert that loses a race against a
/// concurrent writer is converted to the same duplicate path.
///
/// # Errors
/// Returns [`VaultError::Validation`] for malformed input,
/// [`VaultError::UniquenessViolation`] when an insert conflicts with a record that
/// cannot be found again, and [`VaultError::StoreUnavailable`] when the store fails.
pub fn ingest<L: CycleLedger>(
    ledger: &mut L,
    draft: &CycleDraft,
    origin: &IngestOrigin,
) -> Result<IngestReceipt, VaultError> {
    draft.validate()?;
    origin.validate()?;
    let cycle_hash = draft.cycle_hash();

    let attempt = ledger.transact(|tx| {
        if let Some(existing) = find_existing(tx, &cycle_hash, &draft.signifier)? {
            return log_duplicate(tx, existing, origin);
        }

        let cycle = tx.insert_cycle(draft, &cycle_hash)?;
        let provenance = tx.append_provenance(&ProvenanceDraft::for_cycle(
            &cycle,
            origin,
            IngestEvent::Ingest,
        ))?;
        Ok(IngestReceipt { cycle, created: true, provenance })
    });

    let receipt = match attempt {
        Ok(receipt) => receipt,
        Err(StoreFault::Unique(key)) => {
            tracing::warn!(
                signifier = %draft.signifier,
                cycle_hash = %cycle_hash,
                key = %key,
                "ingest insert lost a uniqueness race; resolving as duplicate"
            );
            resolve_insert_race(ledger, draft, &cycle_hash, origin, key)?
        }
        Err(fault) => return Err(fault.into()),
    };

    tracing::info!(
        signifier = %receipt.cycle.signifier,
        cycle_hash = %receipt.cycle.cycle_hash,
        source_address = %origin.source_address,
        node_id = origin.node_id.as_deref().unwrap_or("-"),
        event = receipt.provenance.event.as_str(),
        "ingest recorded"
    );
    Ok(receipt)
}

fn find_existing(
    tx: &dyn CycleTx,
    cycle_hash: &str,
    signifier: &str,
) -> Result<Option<MemoryCycle>, StoreFault> {
    if let Some(found) = tx.find_by_hash(cycle_hash)? {
        return Ok(Some(found));
    }
    tx.find_by_signifier(signifier)
}

fn log_duplicate(
    tx: &dyn CycleTx,
    existing: MemoryCycle,
    origin: &IngestOrigin,
) -> Result<IngestReceipt, StoreFault> {
    let provenance = tx.append_provenance(&ProvenanceDraft::for_cycle(
        &existing,
        origin,
        IngestEvent::DuplicateIngest,
    ))?;
    Ok(IngestReceipt { cycle: existing, created: false, provenance })
}

fn resolve_insert_race<L: CycleLedger>(
    ledger: &mut L,
    draft: &CycleDraft,
    cycle_hash: &str,
    origin: &IngestOrigin,
    key: UniqueKey,
) -> Result<IngestReceipt, VaultError> {
    let resolved = ledger.transact(|tx| {
        match find_existing(tx, cycle_hash, &draft.signifier)? {
            Some(existing) => log_duplicate(tx, existing, origin).map(Some),
            None => Ok(None),
        }
    })?;

    resolved.ok_or(VaultError::UniquenessViolation { key })
}
