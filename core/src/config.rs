//! Run configuration.
//!
//! Everything here is validated before any service is started; a bad value
//! is a fatal configuration error carrying the offending field name.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;

use drift_common::parse_duration;

use crate::error::DriftError;

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub service: ServiceConfig,
    pub communication: CommunicationConfig,
    pub run: RunOptions,
    pub comparison: ComparisonConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            communication: CommunicationConfig::default(),
            run: RunOptions::default(),
            comparison: ComparisonConfig::default(),
        }
    }
}

impl RunConfig {
    /// Checks everything that can be checked without touching the system.
    pub fn validate(&self) -> Result<(), DriftError> {
        if self.service.start_command.trim().is_empty() {
            return Err(DriftError::Configuration(
                "service.start_command must be set".to_string(),
            ));
        }
        if self.service.port == 0 {
            return Err(DriftError::Configuration(
                "service.port must be a non-zero port".to_string(),
            ));
        }
        if self.run.concurrency == 0 {
            return Err(DriftError::Configuration(
                "run.concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(pattern) = &self.run.filter_regex {
            regex::Regex::new(pattern).map_err(|err| {
                DriftError::Configuration(format!("run.filter_regex is invalid: {err}"))
            })?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Shell command that starts the service under test.
    pub start_command: String,
    /// Port the service listens on; live root requests are issued against
    /// it and the default health probe connects to it.
    pub port: u16,
    pub readiness: ReadinessConfig,
    /// How long to wait between SIGTERM and SIGKILL on stop.
    #[serde(deserialize_with = "de_duration")]
    pub stop_grace_period: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            start_command: String::new(),
            port: 3000,
            readiness: ReadinessConfig::default(),
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Shell command that exits 0 once the service is ready.
    pub command: Option<String>,
    /// Port to connect-probe instead of running a command. When neither is
    /// set the service port is probed.
    pub port: Option<u16>,
    #[serde(deserialize_with = "de_duration")]
    pub interval: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            command: None,
            port: None,
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationType {
    /// Filesystem rendezvous where the platform has it, TCP elsewhere.
    #[default]
    Auto,
    Unix,
    Tcp,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    #[serde(rename = "type")]
    pub kind: CommunicationType,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Number of test cases replayed concurrently against one service
    /// instance.
    pub concurrency: usize,
    #[serde(deserialize_with = "de_duration")]
    pub per_test_timeout: Duration,
    /// Only run tests whose display name or trace id matches.
    pub filter_regex: Option<String>,
    /// Newline-delimited results file; nothing is persisted when unset.
    pub results_path: Option<PathBuf>,
    /// Restart attempts after a crash before giving up on a group.
    pub restart_retries: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            per_test_timeout: Duration::from_secs(30),
            filter_regex: None,
            results_path: None,
            restart_retries: 3,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Exact field paths to skip, e.g. `body.meta.generated_at`.
    pub ignore_fields: Vec<String>,
    /// Glob patterns over field paths, e.g. `body.items[*].cursor`.
    pub ignore_patterns: Vec<String>,
    /// Response headers to ignore in addition to the built-in volatile set.
    pub ignore_headers: Vec<String>,
    pub ignore_uuids: bool,
    pub ignore_timestamps: bool,
    pub ignore_dates: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> RunConfig {
        let mut config = RunConfig::default();
        config.service.start_command = "npm start".to_string();
        config
    }

    #[test]
    fn default_config_needs_a_start_command() {
        let err = RunConfig::default().validate().unwrap_err();
        assert!(matches!(err, DriftError::Configuration(_)));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = valid();
        config.run.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_filter_regex_is_rejected() {
        let mut config = valid();
        config.run.filter_regex = Some("(".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_toml_with_duration_strings() {
        let config: RunConfig = toml::from_str(
            r#"
            [service]
            start_command = "npm start"
            port = 8080
            stop_grace_period = "2s"

            [service.readiness]
            command = "curl -sf http://127.0.0.1:8080/health"
            interval = "100ms"
            timeout = "10s"

            [communication]
            type = "tcp"

            [run]
            concurrency = 8
            per_test_timeout = "5s"

            [comparison]
            ignore_timestamps = true
            ignore_headers = ["x-served-by"]
            "#,
        )
        .unwrap();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.stop_grace_period, Duration::from_secs(2));
        assert_eq!(config.service.readiness.interval, Duration::from_millis(100));
        assert_eq!(config.communication.kind, CommunicationType::Tcp);
        assert_eq!(config.run.concurrency, 8);
        assert!(config.comparison.ignore_timestamps);
        assert!(config.validate().is_ok());
    }
}
