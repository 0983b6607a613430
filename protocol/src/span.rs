//! The span record: one line of a trace file.
//!
//! Spans are read-only once parsed. Recordings produced by older SDKs encode
//! the kind as an OpenTelemetry-style integer, and a few broken exporters
//! tag roots as `CLIENT`; [`Span::reconcile_kind`] repairs both from the
//! `is_root` / `is_pre_app_start` capability flags.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use crate::schema::SchemaNode;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    /// The inbound request this trace was recorded for.
    Server,
    /// An outbound dependency call made while handling the root.
    Client,
    /// State captured before the service started handling requests.
    #[default]
    Internal,
}

impl<'de> Deserialize<'de> for SpanKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Current recordings use uppercase strings; legacy recordings carry
        // the OpenTelemetry numeric kind.
        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::String(s) => match s.to_ascii_uppercase().as_str() {
                "SERVER" => Ok(SpanKind::Server),
                "CLIENT" => Ok(SpanKind::Client),
                _ => Ok(SpanKind::Internal),
            },
            Value::Number(n) => match n.as_i64() {
                Some(2) => Ok(SpanKind::Server),
                Some(3) => Ok(SpanKind::Client),
                _ => Ok(SpanKind::Internal),
            },
            _ => Ok(SpanKind::Internal),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    #[serde(default)]
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One recorded span. Unknown fields are tolerated so that newer SDKs can
/// add attributes without breaking older replay builds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub submodule_name: String,
    #[serde(default)]
    pub kind: SpanKind,
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default)]
    pub is_pre_app_start: bool,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_value: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<SchemaNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<SchemaNode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_value_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_value_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_schema_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_schema_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Span {
    /// Repairs the kind tag when it disagrees with the capability flags.
    /// The flags are authoritative: they are written by the instrumentation
    /// itself, while the kind passed through several historical encodings.
    pub fn reconcile_kind(&mut self) {
        if self.is_root && self.kind != SpanKind::Server {
            self.kind = SpanKind::Server;
        } else if self.is_pre_app_start && self.kind != SpanKind::Internal {
            self.kind = SpanKind::Internal;
        }
    }

    pub fn is_server(&self) -> bool {
        self.kind == SpanKind::Server
    }

    pub fn is_client(&self) -> bool {
        self.kind == SpanKind::Client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn deserializes_string_kinds() {
        let span: Span = serde_json::from_value(json!({
            "trace_id": "t1",
            "span_id": "s1",
            "kind": "SERVER",
        }))
        .unwrap();
        assert_eq!(span.kind, SpanKind::Server);
    }

    #[test]
    fn deserializes_legacy_numeric_kinds() {
        let span: Span = serde_json::from_value(json!({
            "trace_id": "t1",
            "span_id": "s1",
            "kind": 3,
        }))
        .unwrap();
        assert_eq!(span.kind, SpanKind::Client);
    }

    #[test]
    fn reconcile_prefers_capability_flags() {
        let mut span: Span = serde_json::from_value(json!({
            "trace_id": "t1",
            "span_id": "s1",
            "kind": "CLIENT",
            "is_root": true,
        }))
        .unwrap();
        span.reconcile_kind();
        assert_eq!(span.kind, SpanKind::Server);

        let mut snapshot: Span = serde_json::from_value(json!({
            "trace_id": "t1",
            "span_id": "s2",
            "kind": 2,
            "is_pre_app_start": true,
        }))
        .unwrap();
        snapshot.reconcile_kind();
        assert_eq!(snapshot.kind, SpanKind::Internal);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let span: Span = serde_json::from_value(json!({
            "trace_id": "t1",
            "span_id": "s1",
            "kind": "CLIENT",
            "some_future_field": {"a": 1},
        }))
        .unwrap();
        assert_eq!(span.kind, SpanKind::Client);
    }
}
