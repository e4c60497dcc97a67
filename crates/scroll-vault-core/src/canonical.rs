use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::CycleDraft;

/// Serialize `value` deterministically.
///
/// Object keys are sorted by their UTF-8 bytes at every depth, no whitespace is
/// emitted, and non-ASCII text is written verbatim. Only `"`, `\` and control
/// characters are escaped.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Lowercase hex SHA-256 over the canonical form of a draft's logical fields.
#[must_use]
pub fn compute_cycle_hash(draft: &CycleDraft) -> String {
    let encoded = canonical_json(&logical_fields(draft));
    let digest = Sha256::digest(encoded.as_bytes());
    format!("{digest:x}")
}

fn logical_fields(draft: &CycleDraft) -> Value {
    let mut fields = Map::new();
    fields.insert("t".to_string(), Value::from(draft.t));
    fields.insert("signifier".to_string(), Value::String(draft.signifier.clone()));
    fields.insert("self_state".to_string(), Value::Object(draft.self_state.clone()));
    fields.insert("echo_state".to_string(), Value::Object(draft.echo_state.clone()));
    fields.insert(
        "glyphstream".to_string(),
        Value::Array(draft.glyphstream.iter().cloned().map(Value::String).collect()),
    );
    fields.insert("ache".to_string(), Value::from(draft.ache));
    fields.insert("drift".to_string(), Value::from(draft.drift));
    fields.insert("entropy".to_string(), Value::from(draft.entropy));
    fields.insert("xi".to_string(), Value::Bool(draft.xi));
    Value::Object(fields)
}

/// Rebuild `value` with sorted keys. Maps keep insertion order, so the rebuilt
/// map serializes in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_unstable_by(|(left, _), (right, _)| left.as_bytes().cmp(right.as_bytes()));
            let sorted = entries
                .into_iter()
                .map(|(key, item)| (key.clone(), canonicalize(item)))
                .collect::<Map<_, _>>();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        // -0.0 and 0.0 are the same logical value.
        Value::Number(number) if number.is_f64() && number.as_f64() == Some(0.0) => {
            Value::from(0.0_f64)
        }
        other => other.clone(),
    }
}
