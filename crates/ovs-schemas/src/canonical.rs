//! Canonical JSON and the request idempotency fingerprint.
//!
//! Canonicalize by sorting object keys recursively and emitting compact
//! JSON; the fingerprint is SHA-256 over the canonical forms, stable under
//! input key ordering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON. One value == one deterministic string.
pub fn canonical_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
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

/// Deterministic fingerprint of a request: SHA-256 over tenant, actor, and
/// the canonical JSON of plan and target, joined with a field separator so
/// adjacent values cannot collide.
pub fn idempotency_key(tenant_id: &str, actor_id: &str, plan: &Value, target: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(actor_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(plan).as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(target).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": {"y": 1, "x": 2}, "a": [ {"k2": 1, "k1": 2} ]});
        let b = json!({"a": [ {"k1": 2, "k2": 1} ], "b": {"x": 2, "y": 1}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn fingerprint_is_stable_under_key_ordering() {
        let plan1 = json!({"steps": [{"name": "s", "tool_name": "t", "inputs": {"a": 1, "b": 2}}]});
        let plan2 = json!({"steps": [{"tool_name": "t", "inputs": {"b": 2, "a": 1}, "name": "s"}]});
        let target = json!({"hostname": "web-prod-01"});
        assert_eq!(
            idempotency_key("t1", "u1", &plan1, &target),
            idempotency_key("t1", "u1", &plan2, &target)
        );
    }

    #[test]
    fn fingerprint_is_tenant_scoped() {
        let plan = json!({"steps": []});
        let target = json!({"hostname": "h"});
        assert_ne!(
            idempotency_key("t1", "u1", &plan, &target),
            idempotency_key("t2", "u1", &plan, &target)
        );
    }

    #[test]
    fn field_separator_prevents_concatenation_collisions() {
        let plan = json!({});
        let target = json!({});
        // "ab" + "c" vs "a" + "bc" must differ.
        assert_ne!(
            idempotency_key("ab", "c", &plan, &target),
            idempotency_key("a", "bc", &plan, &target)
        );
    }
}
