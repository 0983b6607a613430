//! Engine error taxonomy.
//!
//! Only failures that stop work become errors: bad configuration (fatal
//! before anything starts), a service that never became ready (fatal for
//! its environment group), and transport setup failures (fatal for the
//! run). Matcher misses and per-test failures are data, not errors; they
//! surface through events and test results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service startup failed: {0}")]
    Startup(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Trace(#[from] drift_protocol::TraceError),

    #[error(transparent)]
    Protocol(#[from] drift_protocol::ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DriftError>;
