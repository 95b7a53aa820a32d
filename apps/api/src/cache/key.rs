//! Deterministic cache-key derivation.
//!
//! Two calls with identical semantic parameters in different literal order
//! must produce the same key: params keys are sorted lexicographically,
//! null/absent values dropped, and the remainder serialized to compact JSON
//! before being combined with method and scope.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

const KEY_PREFIX: &str = "vitae:cache";

/// Derives the cache key for `(method, scope_id, params)`.
pub fn cache_key(method: &str, scope_id: &str, params: &Map<String, Value>) -> String {
    format!(
        "{KEY_PREFIX}:{method}:{scope_id}:{}",
        canonical_params(params)
    )
}

/// Key prefix covering every parameter set of one `(method, scope)` pair.
/// Used for wildcard invalidation of a read method within a scope.
pub fn method_scope_prefix(method: &str, scope_id: &str) -> String {
    format!("{KEY_PREFIX}:{method}:{scope_id}:")
}

/// Key prefix covering every cached entry for a scope, any method.
/// Redis-side this needs a mid-key wildcard; see `scope_scan_pattern`.
pub fn scope_scan_pattern(scope_id: &str) -> String {
    format!("{KEY_PREFIX}:*:{scope_id}:*")
}

/// Canonical compact serialization of a params object: keys sorted,
/// nulls dropped. Nested objects are canonicalized recursively.
fn canonical_params(params: &Map<String, Value>) -> String {
    let canonical = canonicalize(params);
    serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string())
}

fn canonicalize(params: &Map<String, Value>) -> BTreeMap<String, Value> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::Object(inner) => {
                    Value::Object(canonicalize(inner).into_iter().collect())
                }
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_key_independent_of_insertion_order() {
        let a = obj(json!({ "a": 1, "b": 2 }));
        let mut b = Map::new();
        b.insert("b".to_string(), json!(2));
        b.insert("a".to_string(), json!(1));

        assert_eq!(
            cache_key("list_projects", "scope-1", &a),
            cache_key("list_projects", "scope-1", &b)
        );
    }

    #[test]
    fn test_null_values_dropped() {
        let with_null = obj(json!({ "a": 1, "b": null }));
        let without = obj(json!({ "a": 1 }));
        assert_eq!(
            cache_key("list_projects", "s", &with_null),
            cache_key("list_projects", "s", &without)
        );
    }

    #[test]
    fn test_nested_objects_canonicalized() {
        let a = obj(json!({ "filter": { "x": 1, "y": 2 } }));
        let b = obj(json!({ "filter": { "y": 2, "x": 1 } }));
        assert_eq!(
            cache_key("list_projects", "s", &a),
            cache_key("list_projects", "s", &b)
        );
    }

    #[test]
    fn test_different_methods_and_scopes_differ() {
        let params = obj(json!({ "a": 1 }));
        let k1 = cache_key("list_projects", "s1", &params);
        assert_ne!(k1, cache_key("list_skills", "s1", &params));
        assert_ne!(k1, cache_key("list_projects", "s2", &params));
    }

    #[test]
    fn test_prefix_covers_derived_keys() {
        let params = obj(json!({ "a": 1 }));
        let key = cache_key("list_projects", "s1", &params);
        assert!(key.starts_with(&method_scope_prefix("list_projects", "s1")));
    }
}
