//! Serves recorded mocks to the instrumented service.
//!
//! The executor installs one [`TestSession`] per in-flight test, keyed by
//! trace id. Connection handlers only ever read the session map; install
//! and remove touch single keys, so a read/write lock keeps concurrent
//! trace lookups cheap. Consumption marks are per-session, guarded by the
//! session's own mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use drift_protocol::Envelope;
use drift_protocol::EventKind;
use drift_protocol::GetMockRequest;
use drift_protocol::MockReply;
use drift_protocol::Span;
use drift_protocol::TestCase;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::events::LogBus;
use crate::events::MissRegistry;
use crate::events::MockNotFoundEvent;
use crate::events::RunEvent;
use crate::matcher::MatchCandidate;
use crate::matcher::is_reusable;
use crate::matcher::select_mock;
use crate::transport::TransportListener;
use crate::transport::TransportStream;

/// One test's candidate mock set plus its consumption marks.
pub struct TestSession {
    pub trace_id: String,
    spans: Vec<Arc<Span>>,
    consumed: Mutex<Vec<bool>>,
}

impl TestSession {
    pub fn new(test: &TestCase) -> Arc<Self> {
        Arc::new(Self {
            trace_id: test.trace_id.clone(),
            consumed: Mutex::new(vec![false; test.mocks.len()]),
            spans: test.mocks.clone(),
        })
    }

    /// Runs the matcher against the current consumption state and, on a
    /// hit, marks the chosen span consumed unless it is a reusable read.
    fn select(&self, request: &GetMockRequest) -> Option<(Arc<Span>, f64)> {
        let mut consumed = self.consumed.lock().ok()?;
        let candidates: Vec<MatchCandidate> = self
            .spans
            .iter()
            .zip(consumed.iter())
            .map(|(span, consumed)| MatchCandidate {
                span: span.clone(),
                consumed: *consumed,
            })
            .collect();
        let selection = select_mock(&candidates, request)?;
        let span = self.spans[selection.index].clone();
        if !is_reusable(&span) {
            consumed[selection.index] = true;
        }
        Some((span, selection.score))
    }
}

pub struct MockServer {
    sessions: RwLock<HashMap<String, Arc<TestSession>>>,
    misses: MissRegistry,
    bus: LogBus,
}

impl MockServer {
    pub fn new(bus: LogBus) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            misses: MissRegistry::default(),
            bus,
        })
    }

    /// Makes a test's span set addressable by its trace id.
    pub fn install(&self, session: Arc<TestSession>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session.trace_id.clone(), session);
        }
    }

    pub fn remove(&self, trace_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(trace_id);
        }
    }

    /// Matcher misses recorded for a trace, for post-run diagnostics.
    pub fn misses_for(&self, trace_id: &str) -> Vec<MockNotFoundEvent> {
        self.misses.for_trace(trace_id)
    }

    pub fn total_misses(&self) -> usize {
        self.misses.total()
    }

    /// Accept loop. Each connection gets its own task; the loop ends when
    /// the cancellation token trips, which also unblocks in-flight reads by
    /// dropping the listener.
    pub async fn serve(self: Arc<Self>, listener: TransportListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let server = self.clone();
                        let connection_cancel = cancel.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, connection_cancel).await;
                        });
                    }
                    Err(err) => {
                        warn!(?err, "mock listener accept failed");
                        break;
                    }
                },
            }
        }
        listener.cleanup();
    }

    async fn handle_connection(&self, mut stream: TransportStream, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                read = stream.read_envelope() => read,
            };
            match envelope {
                // Clean close, or a connection dropped mid-request; either
                // way there is no per-connection state to unwind.
                Ok(None) => break,
                Err(err) => {
                    debug!(?err, "closing mock connection on malformed frame");
                    break;
                }
                Ok(Some(Envelope::GetMock(request))) => {
                    let reply = self.handle_get_mock(&request);
                    if stream
                        .write_envelope(&Envelope::MockReply(reply))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Some(Envelope::Event(event))) => {
                    if event.kind == EventKind::MockNotFound {
                        self.record_sdk_miss(&event.payload);
                    }
                }
                Ok(Some(Envelope::MockReply(_))) => {
                    debug!("peer sent a reply envelope; closing connection");
                    break;
                }
            }
        }
    }

    fn handle_get_mock(&self, request: &GetMockRequest) -> MockReply {
        let session = self
            .sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(&request.trace_id).cloned());
        let Some(session) = session else {
            self.record_miss(request, "unknown trace");
            return MockReply::not_found();
        };

        match session.select(request) {
            Some((span, score)) => {
                self.bus.publish(RunEvent::SpanReplayed {
                    trace_id: request.trace_id.clone(),
                    span_id: span.span_id.clone(),
                });
                MockReply {
                    found: true,
                    output_value: Some(span.output_value.clone()),
                    span_id: Some(span.span_id.clone()),
                    match_score: Some(score),
                }
            }
            None => {
                self.record_miss(request, "no matching span");
                MockReply::not_found()
            }
        }
    }

    fn record_miss(&self, request: &GetMockRequest, reason: &str) {
        debug!(
            trace_id = %request.trace_id,
            package = %request.package_name,
            operation = %request.operation,
            reason,
            "mock not found"
        );
        let event = MockNotFoundEvent {
            trace_id: request.trace_id.clone(),
            package_name: request.package_name.clone(),
            operation: request.operation.clone(),
            span_name: format!("{} {}", request.package_name, request.operation),
            stack_trace: None,
        };
        self.misses.record(event.clone());
        self.bus.publish(RunEvent::MockNotFound(event));
    }

    /// The SDK reports misses it diagnosed on its side (e.g. after a
    /// dropped connection) as events; fold them into the same registry.
    fn record_sdk_miss(&self, payload: &Value) {
        let field = |name: &str| -> String {
            payload
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let event = MockNotFoundEvent {
            trace_id: field("trace_id"),
            package_name: field("package_name"),
            operation: field("operation"),
            span_name: field("span_name"),
            stack_trace: payload
                .get("stack_trace")
                .and_then(Value::as_str)
                .map(|stack| stack.to_string()),
        };
        self.misses.record(event.clone());
        self.bus.publish(RunEvent::MockNotFound(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommunicationType;
    use drift_protocol::EventEnvelope;
    use drift_protocol::build_test_cases;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_case_with_mocks() -> TestCase {
        let spans = vec![
            serde_json::from_value(json!({
                "trace_id": "t1", "span_id": "root", "kind": "SERVER", "is_root": true,
                "input_value": {"method": "GET", "path": "/users/42"},
                "output_value": {"status": 200, "body": {"id": 42}},
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "trace_id": "t1", "span_id": "db-1", "kind": "CLIENT",
                "package_name": "pg", "submodule_name": "query",
                "input_value": {"query": "SELECT * FROM users WHERE id = $1", "params": [42]},
                "output_value": {"rows": [{"id": 42, "name": "a"}]},
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "trace_id": "t1", "span_id": "cache-1", "kind": "CLIENT",
                "package_name": "redis", "submodule_name": "",
                "input_value": {"command": "SET", "key": "user:42", "value": "x"},
                "output_value": {"reply": "OK"},
            }))
            .unwrap(),
        ];
        build_test_cases(spans).unwrap().remove(0)
    }

    fn get_mock(trace_id: &str, package: &str, submodule: &str, input: Value) -> GetMockRequest {
        GetMockRequest {
            trace_id: trace_id.to_string(),
            package_name: package.to_string(),
            submodule_name: submodule.to_string(),
            operation: "query".to_string(),
            input_value: input,
            input_schema_hash: String::new(),
        }
    }

    #[test]
    fn matched_spans_return_their_recorded_output() {
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));

        let reply = server.handle_get_mock(&get_mock(
            "t1",
            "pg",
            "query",
            json!({"query": "SELECT * FROM users WHERE id = $1", "params": [42]}),
        ));
        assert!(reply.found);
        assert_eq!(reply.output_value, Some(json!({"rows": [{"id": 42, "name": "a"}]})));
        assert_eq!(reply.span_id.as_deref(), Some("db-1"));
    }

    #[test]
    fn unknown_traces_record_a_miss() {
        let server = MockServer::new(LogBus::new());
        let reply = server.handle_get_mock(&get_mock("nope", "pg", "query", json!({})));
        assert!(!reply.found);
        let misses = server.misses_for("nope");
        assert_eq!(misses.len(), 1);
        assert_eq!(misses[0].package_name, "pg");
    }

    #[test]
    fn unmatched_requests_record_a_miss_per_trace() {
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));

        let reply = server.handle_get_mock(&get_mock(
            "t1",
            "redis",
            "",
            json!({"command": "GET", "key": "session:9"}),
        ));
        assert!(!reply.found);
        assert_eq!(server.misses_for("t1").len(), 1);
        assert_eq!(server.total_misses(), 1);
    }

    #[test]
    fn write_spans_are_consumed_once() {
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));
        let request = get_mock(
            "t1",
            "redis",
            "",
            json!({"command": "SET", "key": "user:42", "value": "x"}),
        );
        assert!(server.handle_get_mock(&request).found);
        assert!(!server.handle_get_mock(&request).found);
    }

    #[test]
    fn read_spans_are_replayable() {
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));
        let request = get_mock(
            "t1",
            "pg",
            "query",
            json!({"query": "SELECT * FROM users WHERE id = $1", "params": [42]}),
        );
        assert!(server.handle_get_mock(&request).found);
        assert!(server.handle_get_mock(&request).found);
    }

    #[test]
    fn removing_a_session_makes_its_trace_unknown() {
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));
        server.remove("t1");
        assert!(!server.handle_get_mock(&get_mock("t1", "pg", "query", json!({}))).found);
    }

    #[tokio::test]
    async fn serves_mocks_over_the_transport() {
        let listener = TransportListener::bind(CommunicationType::Tcp).await.unwrap();
        let endpoint = listener.endpoint();
        let cancel = CancellationToken::new();
        let server = MockServer::new(LogBus::new());
        server.install(TestSession::new(&test_case_with_mocks()));
        let serve = tokio::spawn(server.clone().serve(listener, cancel.clone()));

        let mut stream = TransportStream::connect(&endpoint).await.unwrap();
        stream
            .write_envelope(&Envelope::GetMock(get_mock(
                "t1",
                "pg",
                "query",
                json!({"query": "SELECT * FROM users WHERE id = $1", "params": [42]}),
            )))
            .await
            .unwrap();
        let reply = stream.read_envelope().await.unwrap().unwrap();
        match reply {
            Envelope::MockReply(reply) => {
                assert!(reply.found);
                assert_eq!(reply.span_id.as_deref(), Some("db-1"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }

        // SDK-side miss events land in the registry too.
        stream
            .write_envelope(&Envelope::Event(EventEnvelope {
                kind: EventKind::MockNotFound,
                payload: json!({
                    "trace_id": "t1",
                    "package_name": "redis",
                    "operation": "GET",
                    "span_name": "redis GET",
                }),
            }))
            .await
            .unwrap();

        // Events are one-way; poll until the handler has drained it.
        for _ in 0..100 {
            if server.misses_for("t1").iter().any(|m| m.package_name == "redis") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(server.misses_for("t1").iter().any(|m| m.package_name == "redis"));

        cancel.cancel();
        serve.await.unwrap();
    }
}
