//! Shared data model for trace replay.
//!
//! This crate owns everything both sides of the replay boundary agree on:
//! the span schema recorded by the service-side SDK, the trace-file format,
//! the canonical JSON form used for input hashing, and the IPC envelope the
//! SDK speaks to the mock endpoint during replay.

mod canonical;
mod envelope;
mod schema;
mod span;
mod test_case;
mod trace_file;

pub use canonical::canonical_string;
pub use canonical::canonical_value;
pub use canonical::value_hash;
pub use envelope::ENVELOPE_VERSION;
pub use envelope::Envelope;
pub use envelope::EventEnvelope;
pub use envelope::EventKind;
pub use envelope::GetMockRequest;
pub use envelope::MAX_FRAME_LEN;
pub use envelope::MockReply;
pub use envelope::ProtocolError;
pub use schema::SchemaNode;
pub use span::Span;
pub use span::SpanKind;
pub use span::SpanStatus;
pub use span::StatusCode;
pub use test_case::ENV_SNAPSHOT_SPAN_NAME;
pub use test_case::TestCase;
pub use test_case::build_test_cases;
pub use trace_file::TraceError;
pub use trace_file::read_spans;
pub use trace_file::write_spans;
