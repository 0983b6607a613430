//! Recorded value schemas.
//!
//! Every span carries JSON schemas for its input and output values. Two
//! annotations matter at replay time: `match_importance`, which marks
//! subtrees the matcher and comparator should ignore, and `encoding`, which
//! marks fields whose recorded bytes are base64-wrapped JSON and need
//! decoding before structural comparison.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const ENCODING_BASE64_JSON: &str = "base64_json";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,
    /// Recorded as a real number by some SDK versions, but interpreted as a
    /// boolean everywhere: zero means "do not match on this subtree". A
    /// weighted interpretation would be a format-compatible extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_importance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl SchemaNode {
    /// True when the subtree is explicitly excluded from matching.
    pub fn importance_is_zero(&self) -> bool {
        matches!(self.match_importance, Some(v) if v == 0.0)
    }

    fn child(&self, key: &str) -> Option<&SchemaNode> {
        self.properties.get(key)
    }

    /// Projects a value through the schema, dropping every subtree whose
    /// schema carries `match_importance = 0`. Fields without schema coverage
    /// are kept as-is.
    pub fn project(&self, value: &Value) -> Value {
        if self.importance_is_zero() {
            return Value::Null;
        }
        match value {
            Value::Object(map) => {
                let mut projected = serde_json::Map::new();
                for (key, child_value) in map {
                    match self.child(key) {
                        Some(child_schema) if child_schema.importance_is_zero() => {}
                        Some(child_schema) => {
                            projected.insert(key.clone(), child_schema.project(child_value));
                        }
                        None => {
                            projected.insert(key.clone(), child_value.clone());
                        }
                    }
                }
                Value::Object(projected)
            }
            Value::Array(items) => match &self.items {
                Some(item_schema) => Value::Array(
                    items.iter().map(|item| item_schema.project(item)).collect(),
                ),
                None => value.clone(),
            },
            _ => value.clone(),
        }
    }

    /// Applies the schema's encoding descriptors: fields recorded as
    /// base64-wrapped JSON are decoded back into structured values so they
    /// can be walked. Values that fail to decode are left untouched.
    pub fn decode(&self, value: &Value) -> Value {
        if self.encoding.as_deref() == Some(ENCODING_BASE64_JSON) {
            if let Value::String(encoded) = value {
                if let Some(decoded) = decode_base64_json(encoded) {
                    return decoded;
                }
            }
            return value.clone();
        }
        match value {
            Value::Object(map) => {
                let mut decoded = serde_json::Map::new();
                for (key, child_value) in map {
                    let child = match self.child(key) {
                        Some(child_schema) => child_schema.decode(child_value),
                        None => child_value.clone(),
                    };
                    decoded.insert(key.clone(), child);
                }
                Value::Object(decoded)
            }
            Value::Array(items) => match &self.items {
                Some(item_schema) => Value::Array(
                    items.iter().map(|item| item_schema.decode(item)).collect(),
                ),
                None => value.clone(),
            },
            _ => value.clone(),
        }
    }
}

fn decode_base64_json(encoded: &str) -> Option<Value> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema(value: Value) -> SchemaNode {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn projection_drops_zero_importance_subtrees() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "id": {"type": "number"},
                "session": {"type": "string", "match_importance": 0},
            },
        }));
        let projected = schema.project(&json!({"id": 42, "session": "abc"}));
        assert_eq!(projected, json!({"id": 42}));
    }

    #[test]
    fn projection_keeps_uncovered_fields() {
        let schema = schema(json!({"type": "object", "properties": {}}));
        let value = json!({"anything": [1, 2, 3]});
        assert_eq!(schema.project(&value), value);
    }

    #[test]
    fn nonzero_importance_is_kept() {
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "score": {"type": "number", "match_importance": 0.4},
            },
        }));
        let projected = schema.project(&json!({"score": 7}));
        assert_eq!(projected, json!({"score": 7}));
    }

    #[test]
    fn decodes_base64_wrapped_json() {
        let body = BASE64.encode(serde_json::to_vec(&json!({"id": 42})).unwrap());
        let schema = schema(json!({
            "type": "object",
            "properties": {
                "body": {"type": "string", "encoding": "base64_json"},
            },
        }));
        let decoded = schema.decode(&json!({"status": 200, "body": body}));
        assert_eq!(decoded, json!({"status": 200, "body": {"id": 42}}));
    }

    #[test]
    fn undecodable_payloads_are_left_alone() {
        let schema = schema(json!({"type": "string", "encoding": "base64_json"}));
        let value = json!("not base64!!");
        assert_eq!(schema.decode(&value), value);
    }
}
