//! Canonical JSON + payload fingerprinting.
//!
//! Change detection compares SHA-256 fingerprints of serialized payloads, so
//! serialization must be byte-stable: object keys sorted recursively, compact
//! separators, UTF-8 without BOM. Two payloads that are equal as mappings
//! must hash identically regardless of construction order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compact JSON with all object keys sorted recursively.
pub fn canonical_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

/// SHA-256 over the canonical serialization; 32 raw bytes as stored in the
/// outbox `HashPayload` column.
pub fn fingerprint(canonical: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_vec()
}

pub fn fingerprint_hex(canonical: &str) -> String {
    hex::encode(fingerprint(canonical))
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_mappings_hash_identically_regardless_of_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(fingerprint(&canonical_json(&a)), fingerprint(&canonical_json(&b)));
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let v = json!({"zeta": [ {"b": 1, "a": 2} ], "alpha": "x"});
        assert_eq!(
            canonical_json(&v),
            r#"{"alpha":"x","zeta":[{"a":2,"b":1}]}"#
        );
    }

    #[test]
    fn fingerprint_is_32_bytes() {
        let h = fingerprint(&canonical_json(&json!({"cpf": "123"})));
        assert_eq!(h.len(), 32);
    }

    #[test]
    fn different_payloads_differ() {
        let a = canonical_json(&json!({"sit": 3}));
        let b = canonical_json(&json!({"sit": 4}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
