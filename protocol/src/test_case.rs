//! Replayable test cases.
//!
//! A test case is one trace flattened for execution: the root span (the
//! recorded inbound request) plus every CLIENT span of the trace as the
//! candidate mock set. Spans are shared read-only across worker tasks, so
//! the case holds them behind `Arc`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::canonical::canonical_string;
use crate::span::Span;
use crate::span::SpanKind;
use crate::trace_file::TraceError;

/// Name of the pre-app-start span that captures the recording process's
/// environment variables.
pub const ENV_SNAPSHOT_SPAN_NAME: &str = "ENV_VARS_SNAPSHOT";

#[derive(Clone, Debug)]
pub struct TestCase {
    pub trace_id: String,
    pub root: Arc<Span>,
    /// Candidate mock set, in recorded order.
    pub mocks: Vec<Arc<Span>>,
    pub pre_app_start: Vec<Arc<Span>>,
}

impl TestCase {
    /// Builds the test case for a single trace. The trace must contain a
    /// root span.
    pub fn from_spans(trace_id: String, spans: Vec<Span>) -> Result<Self, TraceError> {
        let mut root = None;
        let mut mocks = Vec::new();
        let mut pre_app_start = Vec::new();
        for span in spans {
            let span = Arc::new(span);
            match span.kind {
                SpanKind::Server => {
                    if root.is_none() {
                        root = Some(span);
                    }
                }
                SpanKind::Client => mocks.push(span),
                SpanKind::Internal => {
                    if span.is_pre_app_start {
                        pre_app_start.push(span);
                    }
                }
            }
        }
        let root = root.ok_or(TraceError::MissingRoot {
            trace_id: trace_id.clone(),
        })?;
        Ok(Self {
            trace_id,
            root,
            mocks,
            pre_app_start,
        })
    }

    pub fn method(&self) -> Option<&str> {
        self.root.input_value.get("method").and_then(Value::as_str)
    }

    pub fn path(&self) -> &str {
        self.root
            .input_value
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
    }

    pub fn request_headers(&self) -> BTreeMap<String, String> {
        header_map(self.root.input_value.get("headers"))
    }

    pub fn request_body(&self) -> Option<&Value> {
        match self.root.input_value.get("body") {
            Some(Value::Null) | None => None,
            Some(body) => Some(body),
        }
    }

    pub fn response_headers(&self) -> BTreeMap<String, String> {
        header_map(self.root.output_value.get("headers"))
    }

    pub fn response_body(&self) -> Option<&Value> {
        match self.root.output_value.get("body") {
            Some(Value::Null) | None => None,
            Some(body) => Some(body),
        }
    }

    pub fn response_status(&self) -> Option<u16> {
        self.root
            .output_value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
    }

    /// Label used in logs and result lines: `"GET /users/42"` when the root
    /// recorded a method, otherwise the trace id.
    pub fn display_name(&self) -> String {
        match self.method() {
            Some(method) => format!("{method} {}", self.path()),
            None => self.trace_id.clone(),
        }
    }

    /// Canonical serialization of the recorded environment snapshot, used
    /// as the grouping key. Byte-equal snapshots share a service instance.
    pub fn env_snapshot_key(&self) -> Option<String> {
        self.env_snapshot_span()
            .map(|span| canonical_string(&span.input_value))
    }

    /// The recorded environment variables, to be injected into the replayed
    /// service process.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let Some(span) = self.env_snapshot_span() else {
            return BTreeMap::new();
        };
        let Some(map) = span.input_value.as_object() else {
            return BTreeMap::new();
        };
        map.iter()
            .filter_map(|(key, value)| {
                value.as_str().map(|value| (key.clone(), value.to_string()))
            })
            .collect()
    }

    fn env_snapshot_span(&self) -> Option<&Arc<Span>> {
        self.pre_app_start
            .iter()
            .find(|span| span.name == ENV_SNAPSHOT_SPAN_NAME)
    }
}

pub(crate) fn header_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            };
            rendered.map(|value| (key.clone(), value))
        })
        .collect()
}

/// Groups a file's spans by trace and builds one test case per trace, in
/// first-seen order. Pre-app-start spans recorded under their own trace id
/// apply to every test case in the file.
pub fn build_test_cases(spans: Vec<Span>) -> Result<Vec<TestCase>, TraceError> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Span>> = HashMap::new();
    for span in spans {
        if !groups.contains_key(&span.trace_id) {
            order.push(span.trace_id.clone());
        }
        groups.entry(span.trace_id.clone()).or_default().push(span);
    }

    // Traces made up solely of pre-app-start snapshots describe the process,
    // not a request; they contribute their spans to every real test case.
    let mut ambient: Vec<Arc<Span>> = Vec::new();
    let mut request_traces: Vec<(String, Vec<Span>)> = Vec::new();
    for trace_id in order {
        let spans = groups.remove(&trace_id).unwrap_or_default();
        if spans.iter().all(|span| span.is_pre_app_start) {
            ambient.extend(spans.into_iter().map(Arc::new));
        } else {
            request_traces.push((trace_id, spans));
        }
    }

    let mut cases = Vec::new();
    for (trace_id, spans) in request_traces {
        let mut case = TestCase::from_spans(trace_id, spans)?;
        case.pre_app_start.extend(ambient.iter().cloned());
        cases.push(case);
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn span(value: Value) -> Span {
        let mut span: Span = serde_json::from_value(value).unwrap();
        span.reconcile_kind();
        span
    }

    fn root_span(trace_id: &str) -> Span {
        span(json!({
            "trace_id": trace_id,
            "span_id": format!("{trace_id}-root"),
            "kind": "SERVER",
            "is_root": true,
            "input_value": {
                "method": "GET",
                "path": "/users/42",
                "headers": {"accept": "application/json"},
            },
            "output_value": {"status": 200, "body": {"id": 42}},
        }))
    }

    #[test]
    fn builds_case_with_mocks_in_recorded_order() {
        let spans = vec![
            root_span("t1"),
            span(json!({
                "trace_id": "t1", "span_id": "s2", "kind": "CLIENT",
                "package_name": "pg",
            })),
            span(json!({
                "trace_id": "t1", "span_id": "s3", "kind": "CLIENT",
                "package_name": "redis",
            })),
        ];
        let cases = build_test_cases(spans).unwrap();
        assert_eq!(cases.len(), 1);
        let case = &cases[0];
        assert_eq!(case.method(), Some("GET"));
        assert_eq!(case.path(), "/users/42");
        assert_eq!(case.response_status(), Some(200));
        assert_eq!(case.display_name(), "GET /users/42");
        let packages: Vec<&str> = case
            .mocks
            .iter()
            .map(|m| m.package_name.as_str())
            .collect();
        assert_eq!(packages, vec!["pg", "redis"]);
    }

    #[test]
    fn trace_without_root_is_rejected() {
        let spans = vec![span(json!({
            "trace_id": "t1", "span_id": "s1", "kind": "CLIENT",
        }))];
        let err = build_test_cases(spans).unwrap_err();
        assert!(matches!(err, TraceError::MissingRoot { trace_id } if trace_id == "t1"));
    }

    #[test]
    fn env_snapshot_key_groups_byte_equal_environments() {
        let make_case = |trace: &str, vars: Value| {
            let spans = vec![
                root_span(trace),
                span(json!({
                    "trace_id": trace, "span_id": format!("{trace}-env"),
                    "kind": "INTERNAL", "is_pre_app_start": true,
                    "name": ENV_SNAPSHOT_SPAN_NAME,
                    "input_value": vars,
                })),
            ];
            build_test_cases(spans).unwrap().remove(0)
        };

        let a = make_case("t1", json!({"A": "1", "B": "2"}));
        let b = make_case("t2", json!({"B": "2", "A": "1"}));
        let c = make_case("t3", json!({"A": "2"}));
        assert_eq!(a.env_snapshot_key(), b.env_snapshot_key());
        assert_ne!(a.env_snapshot_key(), c.env_snapshot_key());
        assert_eq!(
            a.env_vars(),
            BTreeMap::from([("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())])
        );
    }

    #[test]
    fn missing_snapshot_yields_no_key() {
        let cases = build_test_cases(vec![root_span("t1")]).unwrap();
        assert_eq!(cases[0].env_snapshot_key(), None);
        assert!(cases[0].env_vars().is_empty());
    }

    #[test]
    fn snapshot_under_its_own_trace_applies_to_all_cases() {
        let spans = vec![
            span(json!({
                "trace_id": "boot", "span_id": "b1",
                "kind": "INTERNAL", "is_pre_app_start": true,
                "name": ENV_SNAPSHOT_SPAN_NAME,
                "input_value": {"A": "1"},
            })),
            root_span("t1"),
            root_span("t2"),
        ];
        let cases = build_test_cases(spans).unwrap();
        assert_eq!(cases.len(), 2);
        for case in &cases {
            assert!(case.env_snapshot_key().is_some());
        }
    }
}
