//! The run's event fan-out.
//!
//! Collaborators (the terminal UI, the cloud uploader) observe a run
//! through [`RunEvent`]s on a bounded broadcast channel. Publishing never
//! blocks and never fails the engine: with no subscribers events are
//! dropped, and a subscriber that falls behind loses the oldest events
//! rather than stalling a worker.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::executor::RunSummary;
use crate::executor::TestResult;
use crate::supervisor::SupervisorState;

const BUS_CAPACITY: usize = 1024;

/// Recorded whenever the matcher cannot satisfy an outbound call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MockNotFoundEvent {
    pub trace_id: String,
    pub package_name: String,
    pub operation: String,
    pub span_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Clone, Debug)]
pub enum RunEvent {
    ServiceStdout(String),
    ServiceStderr(String),
    ServiceStateChanged(SupervisorState),
    TestStarted { trace_id: String, name: String },
    TestCompleted(TestResult),
    MockNotFound(MockNotFoundEvent),
    SpanReplayed { trace_id: String, span_id: String },
    AllCompleted(RunSummary),
}

/// Append-only event channel shared by every engine component.
#[derive(Clone)]
pub struct LogBus {
    tx: broadcast::Sender<RunEvent>,
}

impl LogBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-trace record of matcher misses, kept for post-run diagnostics.
#[derive(Default)]
pub struct MissRegistry {
    inner: Mutex<HashMap<String, Vec<MockNotFoundEvent>>>,
}

impl MissRegistry {
    pub fn record(&self, event: MockNotFoundEvent) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entry(event.trace_id.clone()).or_default().push(event);
        }
    }

    pub fn for_trace(&self, trace_id: &str) -> Vec<MockNotFoundEvent> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.get(trace_id).cloned())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn miss(trace_id: &str) -> MockNotFoundEvent {
        MockNotFoundEvent {
            trace_id: trace_id.to_string(),
            package_name: "redis".to_string(),
            operation: "GET".to_string(),
            span_name: "redis GET".to_string(),
            stack_trace: None,
        }
    }

    #[test]
    fn registry_keys_by_trace() {
        let registry = MissRegistry::default();
        registry.record(miss("t1"));
        registry.record(miss("t1"));
        registry.record(miss("t2"));
        assert_eq!(registry.for_trace("t1").len(), 2);
        assert_eq!(registry.for_trace("t2").len(), 1);
        assert_eq!(registry.for_trace("t3").len(), 0);
        assert_eq!(registry.total(), 3);
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::ServiceStdout("listening".to_string()));
        match rx.recv().await.unwrap() {
            RunEvent::ServiceStdout(line) => assert_eq!(line, "listening"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = LogBus::new();
        bus.publish(RunEvent::ServiceStderr("boom".to_string()));
    }
}
