//! External field spellings.
//!
//! HTTP bodies and archive lines spell three fields with symbols (`ψ_self`, `Σecho`,
//! `Ξ`). Everything inside the vault uses the ASCII names; the types here are the
//! only place the symbolic names appear. Inputs also accept the ASCII names.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    CycleDraft, CyclePatch, IngestEvent, IngestReceipt, MemoryCycle, ProvenanceEntry,
    StateDocument,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CyclePayload {
    pub t: i64,
    pub signifier: String,
    #[serde(rename = "ψ_self", alias = "psi_self", alias = "self_state")]
    pub self_state: StateDocument,
    #[serde(rename = "Σecho", alias = "sigma_echo", alias = "echo_state")]
    pub echo_state: StateDocument,
    pub glyphstream: Vec<String>,
    pub ache: f64,
    pub drift: f64,
    pub entropy: f64,
    #[serde(rename = "Ξ", alias = "xi")]
    pub xi: bool,
}

impl From<CyclePayload> for CycleDraft {
    fn from(payload: CyclePayload) -> Self {
        Self {
            t: payload.t,
            signifier: payload.signifier,
            self_state: payload.self_state,
            echo_state: payload.echo_state,
            glyphstream: payload.glyphstream,
            ache: payload.ache,
            drift: payload.drift,
            entropy: payload.entropy,
            xi: payload.xi,
        }
    }
}

impl From<CycleDraft> for CyclePayload {
    fn from(draft: CycleDraft) -> Self {
        Self {
            t: draft.t,
            signifier: draft.signifier,
            self_state: draft.self_state,
            echo_state: draft.echo_state,
            glyphstream: draft.glyphstream,
            ache: draft.ache,
            drift: draft.drift,
            entropy: draft.entropy,
            xi: draft.xi,
        }
    }
}

/// A stored cycle as returned to callers and written to archives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleView {
    #[serde(flatten)]
    pub fields: CyclePayload,
    pub cycle_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&MemoryCycle> for CycleView {
    fn from(cycle: &MemoryCycle) -> Self {
        Self {
            fields: CyclePayload::from(cycle.to_draft()),
            cycle_hash: cycle.cycle_hash.clone(),
            created_at: cycle.created_at,
            updated_at: cycle.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchPayload {
    #[serde(rename = "Σecho", alias = "sigma_echo", alias = "echo_state")]
    pub echo_state: StateDocument,
    #[serde(rename = "Ξ", alias = "xi")]
    pub xi: bool,
}

impl From<PatchPayload> for CyclePatch {
    fn from(payload: PatchPayload) -> Self {
        Self { echo_state: payload.echo_state, xi: payload.xi }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResponse {
    pub status: IngestStatus,
    pub signifier: String,
    pub cycle_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "Ξ")]
    pub xi: bool,
}

impl From<&IngestReceipt> for IngestResponse {
    fn from(receipt: &IngestReceipt) -> Self {
        Self {
            status: if receipt.created { IngestStatus::Created } else { IngestStatus::Duplicate },
            signifier: receipt.cycle.signifier.clone(),
            cycle_hash: receipt.cycle.cycle_hash.clone(),
            created_at: receipt.cycle.created_at,
            xi: receipt.cycle.xi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvenanceView {
    pub signifier: String,
    pub cycle_hash: String,
    pub source_address: String,
    pub node_id: Option<String>,
    pub event: IngestEvent,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl From<&ProvenanceEntry> for ProvenanceView {
    fn from(entry: &ProvenanceEntry) -> Self {
        Self {
            signifier: entry.signifier.clone(),
            cycle_hash: entry.cycle_hash.clone(),
            source_address: entry.source_address.clone(),
            node_id: entry.node_id.clone(),
            event: entry.event,
            received_at: entry.received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn payload_accepts_symbolic_and_ascii_spellings() {
        let symbolic: CyclePayload = match serde_json::from_value(json!({
            "t": 1, "signifier": "alpha", "ψ_self": {"k": 1}, "Σecho": {}, "glyphstream": ["a"],
            "ache": 0.2, "drift": 0.1, "entropy": 0.05, "Ξ": true
        })) {
            Ok(payload) => payload,
            Err(err) => panic!("symbolic payload must parse: {err}"),
        };
        let ascii: CyclePayload = match serde_json::from_value(json!({
            "t": 1, "signifier": "alpha", "psi_self": {"k": 1}, "sigma_echo": {},
            "glyphstream": ["a"],
            "ache": 0.2, "drift": 0.1, "entropy": 0.05, "xi": true
        })) {
            Ok(payload) => payload,
            Err(err) => panic!("ascii payload must parse: {err}"),
        };

        assert_eq!(symbolic, ascii);
        assert!(CycleDraft::from(symbolic).xi);
    }

    #[test]
    fn payload_is_emitted_with_symbolic_names() {
        let payload = CyclePayload {
            t: 1,
            signifier: "alpha".to_string(),
            self_state: StateDocument::new(),
            echo_state: StateDocument::new(),
            glyphstream: vec![],
            ache: 0.0,
            drift: 0.0,
            entropy: 0.0,
            xi: false,
        };
        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => panic!("payload must serialize: {err}"),
        };

        for key in ["ψ_self", "Σecho", "Ξ"] {
            assert!(value.get(key).is_some(), "missing wire key {key} in {value}");
        }
        for key in ["self_state", "echo_state", "xi"] {
            assert_eq!(value.get(key), None::<&Value>);
        }
    }

    #[test]
    fn missing_field_is_rejected() {
        let result = serde_json::from_value::<CyclePayload>(json!({
            "t": 1, "signifier": "alpha", "ψ_self": {}, "Σecho": {}, "glyphstream": [],
            "ache": 0.2, "drift": 0.1, "entropy": 0.05
        }));
        assert!(result.is_err());
    }
}
