//! The mock IPC envelope.
//!
//! Messages between the in-service SDK and the replay engine's mock
//! endpoint are length-prefixed frames: a 4-byte big-endian payload length
//! followed by a serde_json-encoded [`Envelope`]. The envelope carries a
//! version field so the encoding can evolve without breaking the rendezvous
//! contract.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const ENVELOPE_VERSION: u8 = 1;

/// Upper bound on a single frame. Recorded outbound responses are capped
/// well below this by the SDK; anything larger is a corrupt or hostile
/// peer.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A request from the SDK for the recorded response to an outbound call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetMockRequest {
    pub trace_id: String,
    pub package_name: String,
    #[serde(default)]
    pub submodule_name: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub input_value: Value,
    #[serde(default)]
    pub input_schema_hash: String,
}

/// The engine's answer to a [`GetMockRequest`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MockReply {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

impl MockReply {
    pub fn not_found() -> Self {
        Self::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MockNotFound,
    SpanReplayed,
}

/// A one-way notification in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    GetMock(GetMockRequest),
    MockReply(MockReply),
    Event(EventEnvelope),
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    v: u8,
    #[serde(flatten)]
    envelope: Envelope,
}

impl Envelope {
    /// Encodes the envelope as a frame payload (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let message = WireMessage {
            v: ENVELOPE_VERSION,
            envelope: self.clone(),
        };
        let bytes = serde_json::to_vec(&message)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Decodes a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }
        let message: WireMessage = serde_json::from_slice(payload)?;
        if message.v != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(message.v));
        }
        Ok(message.envelope)
    }
}
