//! Classifies deviations between a recorded and a live root response.
//!
//! The comparator never fails: structural problems become deviations, and
//! an empty deviation list is the definition of a passing test. Deviations
//! come back in depth-first, left-to-right order of the recorded tree so
//! that output is stable across runs.

mod relaxations;

use std::collections::BTreeMap;

use drift_protocol::SchemaNode;
use drift_protocol::Span;
use serde::Serialize;
use serde_json::Value;
use wildmatch::WildMatch;

use crate::config::ComparisonConfig;
use relaxations::Relaxations;

/// Response headers that vary run-to-run regardless of service behavior.
const VOLATILE_HEADERS: [&str; 10] = [
    "age",
    "connection",
    "content-length",
    "date",
    "etag",
    "keep-alive",
    "last-modified",
    "set-cookie",
    "x-request-id",
    "x-trace-id",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationKind {
    Missing,
    Extra,
    Value,
    Type,
    Status,
    Header,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Deviation {
    pub field_path: String,
    pub kind: DeviationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub passed: bool,
    pub deviations: Vec<Deviation>,
}

/// One side of a comparison: status, lower-cased headers, decoded body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseView {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl ResponseView {
    /// The recorded side, read from a root span's `output_value`.
    pub fn from_recorded(root: &Span) -> Self {
        let status = root
            .output_value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or(0);
        let headers = lowercase_headers(root.output_value.get("headers"));
        let body = root.output_value.get("body").cloned().unwrap_or(Value::Null);
        Self {
            status,
            headers,
            body,
        }
    }

    /// The live side, assembled from HTTP response parts. The body is
    /// parsed as JSON when possible and kept as a string otherwise.
    pub fn from_parts<'a, H>(status: u16, headers: H, body: &[u8]) -> Self
    where
        H: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect();
        let body = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
        };
        Self {
            status,
            headers,
            body,
        }
    }
}

fn lowercase_headers(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(name, value)| {
            let rendered = match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            };
            rendered.map(|value| (name.to_ascii_lowercase(), value))
        })
        .collect()
}

pub struct Comparator {
    ignore_fields: Vec<String>,
    ignore_patterns: Vec<WildMatch>,
    ignored_headers: Vec<String>,
    relaxations: Relaxations,
}

impl Comparator {
    pub fn new(config: &ComparisonConfig) -> Self {
        let mut ignored_headers: Vec<String> = VOLATILE_HEADERS
            .iter()
            .map(|header| (*header).to_string())
            .collect();
        ignored_headers.extend(
            config
                .ignore_headers
                .iter()
                .map(|header| header.to_ascii_lowercase()),
        );
        Self {
            ignore_fields: config.ignore_fields.clone(),
            ignore_patterns: config
                .ignore_patterns
                .iter()
                .map(|pattern| WildMatch::new(pattern))
                .collect(),
            ignored_headers,
            relaxations: Relaxations::new(config),
        }
    }

    /// Compares a recorded and a live response. `output_schema` is the root
    /// span's output schema; it drives base64 body decoding and
    /// match-importance reduction.
    pub fn compare(
        &self,
        recorded: &ResponseView,
        live: &ResponseView,
        output_schema: Option<&SchemaNode>,
    ) -> ComparisonOutcome {
        let mut deviations = Vec::new();

        if recorded.status != live.status {
            deviations.push(Deviation {
                field_path: "status".to_string(),
                kind: DeviationKind::Status,
                expected: Some(Value::from(recorded.status)),
                actual: Some(Value::from(live.status)),
                description: format!(
                    "status code {} became {}",
                    recorded.status, live.status
                ),
            });
        }

        self.compare_headers(recorded, live, &mut deviations);

        let body_schema = output_schema.and_then(|schema| schema.properties.get("body"));
        let expected_body = self.reduce_body(&recorded.body, body_schema);
        let actual_body = self.reduce_body(&live.body, body_schema);
        self.walk("body", &expected_body, &actual_body, &mut deviations);

        ComparisonOutcome {
            passed: deviations.is_empty(),
            deviations,
        }
    }

    fn reduce_body(&self, body: &Value, schema: Option<&SchemaNode>) -> Value {
        match schema {
            Some(schema) => schema.project(&schema.decode(body)),
            None => body.clone(),
        }
    }

    fn compare_headers(
        &self,
        recorded: &ResponseView,
        live: &ResponseView,
        deviations: &mut Vec<Deviation>,
    ) {
        for (name, expected) in &recorded.headers {
            if self.header_is_ignored(name) {
                continue;
            }
            match live.headers.get(name) {
                None => deviations.push(Deviation {
                    field_path: format!("headers.{name}"),
                    kind: DeviationKind::Header,
                    expected: Some(Value::String(expected.clone())),
                    actual: None,
                    description: format!("header {name} missing from the live response"),
                }),
                Some(actual) if actual != expected => deviations.push(Deviation {
                    field_path: format!("headers.{name}"),
                    kind: DeviationKind::Header,
                    expected: Some(Value::String(expected.clone())),
                    actual: Some(Value::String(actual.clone())),
                    description: format!("header {name} changed"),
                }),
                Some(_) => {}
            }
        }
        for (name, actual) in &live.headers {
            if self.header_is_ignored(name) || recorded.headers.contains_key(name) {
                continue;
            }
            deviations.push(Deviation {
                field_path: format!("headers.{name}"),
                kind: DeviationKind::Header,
                expected: None,
                actual: Some(Value::String(actual.clone())),
                description: format!("unexpected header {name} in the live response"),
            });
        }
    }

    fn header_is_ignored(&self, name: &str) -> bool {
        self.ignored_headers.iter().any(|ignored| ignored == name)
    }

    fn path_is_ignored(&self, path: &str) -> bool {
        self.ignore_fields.iter().any(|field| field == path)
            || self.ignore_patterns.iter().any(|pattern| pattern.matches(path))
    }

    fn walk(&self, path: &str, expected: &Value, actual: &Value, deviations: &mut Vec<Deviation>) {
        if self.path_is_ignored(path) {
            return;
        }
        match (expected, actual) {
            (Value::Object(expected_map), Value::Object(actual_map)) => {
                for (key, expected_child) in expected_map {
                    let child_path = format!("{path}.{key}");
                    match actual_map.get(key) {
                        Some(actual_child) => {
                            self.walk(&child_path, expected_child, actual_child, deviations);
                        }
                        None => {
                            if !self.path_is_ignored(&child_path) {
                                deviations.push(Deviation {
                                    field_path: child_path.clone(),
                                    kind: DeviationKind::Missing,
                                    expected: Some(expected_child.clone()),
                                    actual: None,
                                    description: format!("{child_path} missing from the live response"),
                                });
                            }
                        }
                    }
                }
                for (key, actual_child) in actual_map {
                    if expected_map.contains_key(key) {
                        continue;
                    }
                    let child_path = format!("{path}.{key}");
                    if !self.path_is_ignored(&child_path) {
                        deviations.push(Deviation {
                            field_path: child_path.clone(),
                            kind: DeviationKind::Extra,
                            expected: None,
                            actual: Some(actual_child.clone()),
                            description: format!("{child_path} not present in the recording"),
                        });
                    }
                }
            }
            (Value::Array(expected_items), Value::Array(actual_items)) => {
                if expected_items.len() != actual_items.len() {
                    deviations.push(Deviation {
                        field_path: path.to_string(),
                        kind: DeviationKind::Value,
                        expected: Some(Value::from(expected_items.len())),
                        actual: Some(Value::from(actual_items.len())),
                        description: format!(
                            "{path} has {} elements instead of {}",
                            actual_items.len(),
                            expected_items.len()
                        ),
                    });
                }
                for (index, (expected_item, actual_item)) in
                    expected_items.iter().zip(actual_items.iter()).enumerate()
                {
                    self.walk(
                        &format!("{path}[{index}]"),
                        expected_item,
                        actual_item,
                        deviations,
                    );
                }
            }
            (expected, actual) => {
                // Relaxations run first so that, say, an RFC 3339 string and
                // an epoch number still count as the same timestamp.
                if values_equal(expected, actual) || self.relaxations.equivalent(expected, actual) {
                    return;
                }
                if discriminant_name(expected) != discriminant_name(actual) {
                    deviations.push(Deviation {
                        field_path: path.to_string(),
                        kind: DeviationKind::Type,
                        expected: Some(expected.clone()),
                        actual: Some(actual.clone()),
                        description: format!(
                            "{path} changed type from {} to {}",
                            discriminant_name(expected),
                            discriminant_name(actual)
                        ),
                    });
                } else {
                    deviations.push(Deviation {
                        field_path: path.to_string(),
                        kind: DeviationKind::Value,
                        expected: Some(expected.clone()),
                        actual: Some(actual.clone()),
                        description: format!("{path} changed"),
                    });
                }
            }
        }
    }
}

fn discriminant_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Value::Number(a), Value::Number(b)) = (a, b) {
        if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
            return a == b;
        }
    }
    a == b
}
