//! Canonical JSON form and input hashing.
//!
//! The SDK hashes every outbound call's input over a canonical form of the
//! value; the matcher recomputes the same hash over live inputs for its
//! exact-match fast path. The two sides must agree byte-for-byte, so the
//! rules live here: object keys sorted recursively, null members omitted,
//! and HTTP header maps reduced to the two content-negotiation headers that
//! are stable across environments.

use serde_json::Map;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

/// Headers kept when canonicalizing a `headers` map. Everything else
/// (user-agent, connection management, tracing headers, cookies) varies
/// between the recording and replay environments.
const ESSENTIAL_HEADERS: [&str; 2] = ["accept", "content-type"];

/// Returns the canonical form of a value: keys sorted, nulls dropped,
/// header maps reduced to their essential entries.
pub fn canonical_value(value: &Value) -> Value {
    canonicalize(value, false)
}

fn canonicalize(value: &Value, reduce_headers: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                let child = &map[key];
                if child.is_null() {
                    continue;
                }
                if reduce_headers && !ESSENTIAL_HEADERS.contains(&key.to_ascii_lowercase().as_str())
                {
                    continue;
                }
                let child_is_headers = key.eq_ignore_ascii_case("headers");
                out.insert(key.clone(), canonicalize(child, child_is_headers));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| canonicalize(item, false)).collect())
        }
        _ => value.clone(),
    }
}

/// Compact serialization of the canonical form.
pub fn canonical_string(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

/// Lower-hex SHA-256 of the canonical form. This is the hash recorded in
/// `input_value_hash` and recomputed for live requests.
pub fn value_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": 3});
        assert_eq!(canonical_string(&value), r#"{"a":3,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn nulls_are_omitted() {
        let value = json!({"a": null, "b": 1, "c": {"d": null}});
        assert_eq!(canonical_string(&value), r#"{"b":1,"c":{}}"#);
    }

    #[test]
    fn header_maps_keep_only_essential_entries() {
        let value = json!({
            "method": "GET",
            "headers": {
                "User-Agent": "curl/8.0",
                "Accept": "application/json",
                "X-Request-Id": "abc",
                "content-type": "application/json",
            },
        });
        assert_eq!(
            canonical_string(&value),
            r#"{"headers":{"Accept":"application/json","content-type":"application/json"},"method":"GET"}"#
        );
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"x": 1, "y": [1, 2]});
        let b = json!({"y": [1, 2], "x": 1});
        assert_eq!(value_hash(&a), value_hash(&b));
    }

    #[test]
    fn hash_differs_on_content() {
        assert_ne!(value_hash(&json!({"x": 1})), value_hash(&json!({"x": 2})));
    }
}
