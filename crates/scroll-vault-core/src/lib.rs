use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

mod canonical;
mod filter;
mod ingest;
pub mod wire;

pub use canonical::{canonical_json, compute_cycle_hash};
pub use filter::{Bound, CycleFilter, FilterColumn, FilterValue, RangePredicate};
pub use ingest::{ingest, CycleLedger, CycleTx, IngestOrigin, IngestReceipt};

/// Opaque structured document carried by `self_state` and `echo_state`.
pub type StateDocument = Map<String, Value>;

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const DEFAULT_QUERY_LIMIT: u32 = 200;
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;
pub const DEFAULT_PROVENANCE_LIMIT: u32 = 100;
pub const DEFAULT_AGGREGATE_WINDOW: i64 = 50;
pub const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VaultError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("uniqueness violation on {key}")]
    UniquenessViolation { key: UniqueKey },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl VaultError {
    /// Stable machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UniquenessViolation { .. } => "uniqueness_violation",
            Self::NotFound(_) => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Failure raised by a store inside one unit of work.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreFault {
    #[error("unique constraint violated on {0}")]
    Unique(UniqueKey),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored row is malformed: {0}")]
    Corrupt(String),
}

impl From<StoreFault> for VaultError {
    fn from(fault: StoreFault) -> Self {
        match fault {
            StoreFault::Unique(key) => Self::UniquenessViolation { key },
            StoreFault::Unavailable(message) | StoreFault::Corrupt(message) => {
                Self::StoreUnavailable(message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UniqueKey {
    CycleHash,
    Signifier,
}

impl UniqueKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CycleHash => "cycle_hash",
            Self::Signifier => "signifier",
        }
    }
}

impl Display for UniqueKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CycleId(pub i64);

impl Display for CycleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical content of a memory cycle as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleDraft {
    pub t: i64,
    pub signifier: String,
    pub self_state: StateDocument,
    pub echo_state: StateDocument,
    pub glyphstream: Vec<String>,
    pub ache: f64,
    pub drift: f64,
    pub entropy: f64,
    pub xi: bool,
}

impl CycleDraft {
    /// Reject drafts that cannot be hashed or stored.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when the signifier is blank or a metric is not finite.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.signifier.trim().is_empty() {
            return Err(VaultError::Validation("signifier MUST be non-empty".to_string()));
        }

        for (name, value) in [("ache", self.ache), ("drift", self.drift), ("entropy", self.entropy)]
        {
            if !value.is_finite() {
                return Err(VaultError::Validation(format!("{name} MUST be a finite number")));
            }
        }

        Ok(())
    }

    /// Canonical SHA-256 fingerprint of this draft's logical fields.
    #[must_use]
    pub fn cycle_hash(&self) -> String {
        compute_cycle_hash(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryCycle {
    pub id: CycleId,
    pub signifier: String,
    pub t: i64,
    pub self_state: StateDocument,
    pub echo_state: StateDocument,
    pub glyphstream: Vec<String>,
    pub ache: f64,
    pub drift: f64,
    pub entropy: f64,
    pub xi: bool,
    pub cycle_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl MemoryCycle {
    /// The logical field set this record currently holds.
    ///
    /// After a patch this no longer hashes to `cycle_hash`; the stored hash is
    /// pinned to the content at creation time.
    #[must_use]
    pub fn to_draft(&self) -> CycleDraft {
        CycleDraft {
            t: self.t,
            signifier: self.signifier.clone(),
            self_state: self.self_state.clone(),
            echo_state: self.echo_state.clone(),
            glyphstream: self.glyphstream.clone(),
            ache: self.ache,
            drift: self.drift,
            entropy: self.entropy,
            xi: self.xi,
        }
    }
}

/// The only mutation a stored cycle accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CyclePatch {
    pub echo_state: StateDocument,
    pub xi: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IngestEvent {
    Ingest,
    DuplicateIngest,
}

impl IngestEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::DuplicateIngest => "duplicate_ingest",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingest" => Some(Self::Ingest),
            "duplicate_ingest" => Some(Self::DuplicateIngest),
            _ => None,
        }
    }
}

/// A provenance row before the store assigns its id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProvenanceDraft {
    pub memory_id: CycleId,
    pub source_address: String,
    pub node_id: Option<String>,
    pub cycle_hash: String,
    pub signifier: String,
    pub event: IngestEvent,
}

impl ProvenanceDraft {
    #[must_use]
    pub fn for_cycle(cycle: &MemoryCycle, origin: &IngestOrigin, event: IngestEvent) -> Self {
        Self {
            memory_id: cycle.id,
            source_address: origin.source_address.clone(),
            node_id: origin.node_id.clone(),
            cycle_hash: cycle.cycle_hash.clone(),
            signifier: cycle.signifier.clone(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProvenanceEntry {
    pub id: i64,
    pub memory_id: CycleId,
    pub source_address: String,
    pub node_id: Option<String>,
    pub cycle_hash: String,
    pub signifier: String,
    pub event: IngestEvent,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub mean_ache: f64,
    pub mean_drift: f64,
    pub mean_entropy: f64,
    pub latest_t: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowAggregate {
    pub window_index: i64,
    pub avg_ache: f64,
    pub avg_drift: f64,
    pub avg_entropy: f64,
    pub count: u64,
}

/// Resolve an optional caller limit against a default and the global cap.
///
/// # Errors
/// Returns [`VaultError::Validation`] when the limit is outside `1..=MAX_LIMIT`.
pub fn resolve_limit(limit: Option<u32>, default: u32) -> Result<u32, VaultError> {
    let limit = limit.unwrap_or(default);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(VaultError::Validation(format!(
            "limit MUST be in 1..={MAX_LIMIT}, got {limit}"
        )));
    }
    Ok(limit)
}

/// Resolve the aggregation bucket width.
///
/// # Errors
/// Returns [`VaultError::Validation`] when the window is smaller than one.
pub fn resolve_window(window: Option<i64>) -> Result<i64, VaultError> {
    let window = window.unwrap_or(DEFAULT_AGGREGATE_WINDOW);
    if window < 1 {
        return Err(VaultError::Validation(format!("window MUST be >= 1, got {window}")));
    }
    Ok(window)
}
