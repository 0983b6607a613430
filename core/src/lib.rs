//! The replay engine.
//!
//! Given a set of recorded test cases, the engine starts the service under
//! test, answers the service's outbound dependency calls from recorded
//! mocks over a local IPC channel, and compares the live response of each
//! replayed root request against the recorded one.
//!
//! Subsystem layout mirrors the run's data flow: the [`executor`] drives
//! [`supervisor`]-managed service lifecycles and dispatches test cases; the
//! [`mock_server`] answers [`transport`] connections by consulting the
//! [`matcher`]; the [`comparator`] classifies deviations in the live root
//! response.

pub mod comparator;
pub mod config;
mod error;
pub mod events;
pub mod executor;
pub mod matcher;
pub mod mock_server;
pub mod supervisor;
pub mod transport;

pub use error::DriftError;
pub use error::Result;
