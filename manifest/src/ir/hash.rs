// Content and IR hashing.
//
// irHash covers the canonical IR with provenance.irHash and
// provenance.compiledAt removed. Canonical form sorts object keys at every
// nesting level and serializes without whitespace.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::Ir;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of the raw source text.
pub fn content_hash(source: &str) -> String {
    sha256_hex(source.as_bytes())
}

/// Recursively key-sorted copy of `value`.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

pub fn compute_ir_hash(ir: &Ir) -> Result<String, serde_json::Error> {
    let mut document = serde_json::to_value(ir)?;
    if let Some(provenance) = document
        .get_mut("provenance")
        .and_then(Value::as_object_mut)
    {
        provenance.remove("irHash");
        provenance.remove("compiledAt");
    }
    Ok(sha256_hex(canonical_json(&document).as_bytes()))
}

/// Recompute the IR hash and compare it with the recorded one.
pub fn verify_ir_hash(ir: &Ir) -> bool {
    match compute_ir_hash(ir) {
        Ok(hash) => hash == ir.provenance.ir_hash,
        Err(_) => false,
    }
}
