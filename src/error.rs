//! Custom error types for the harness.
//!
//! This module defines the primary error type, `HarnessError`, used by every
//! layer of the library. Using the `thiserror` crate, it gives a single place to
//! decide which failures abort a run and which ones are just recorded as a
//! failed step.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: missing or malformed harness config, command table,
//!   condition table or test plan. Fatal: raised before any device I/O.
//! - **`Connection`**: the serial port could not be opened, or an I/O error hit
//!   the link. The connection monitor recovers from these locally with retry and
//!   backoff, so they rarely reach the runner.
//! - **`ProtocolMismatch`** / **`Timeout`**: the device answered with the wrong
//!   prefix or did not answer in time. Recorded as a failed step.
//! - **`UnknownCommand`** / **`UnknownCondition`** / **`UnknownParameter`**:
//!   catalog lookup misses. Recorded as a failed step with a diagnostic.
//!
//! By using `#[from]`, `HarnessError` can be created directly from the
//! underlying parser and I/O errors with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the harness error type.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Every failure the harness can report.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Figment could not load or extract the config
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Config, catalog or plan is semantically invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A catalog file is not valid YAML for its schema
    #[error("YAML error in {path}: {source}")]
    Yaml {
        /// Offending file
        path: String,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// Session JSON could not be written or read
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial link could not be opened or failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Built without the `serial` feature
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    /// Response prefix differs from the expected one
    #[error("Response prefix mismatch: expected '{expected}', got '{actual}'")]
    ProtocolMismatch {
        /// Configured prefix
        expected: String,
        /// Received prefix
        actual: String,
    },

    /// No response line arrived in time
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// Command key missing from the command table
    #[error("Command '{0}' not found in command table")]
    UnknownCommand(String),

    /// Condition key missing from the condition table
    #[error("Condition '{0}' not found in condition table")]
    UnknownCondition(String),

    /// `${name}` placeholder with no matching device parameter
    #[error("Device parameter '{0}' is not defined")]
    UnknownParameter(String),

    /// The monitor task has exited
    #[error("Connection monitor has stopped")]
    MonitorStopped,
}

impl HarnessError {
    /// Whether this error must abort the whole run.
    ///
    /// Only configuration-class errors are fatal. Everything that happens while
    /// talking to the device degrades to a failed step so the report still
    /// covers every attempted step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Config(_)
                | HarnessError::Configuration(_)
                | HarnessError::Yaml { .. }
                | HarnessError::SerialFeatureDisabled
        )
    }

    /// Short category label used in step diagnostics and logs.
    pub fn category(&self) -> &'static str {
        match self {
            HarnessError::Config(_)
            | HarnessError::Configuration(_)
            | HarnessError::Yaml { .. }
            | HarnessError::SerialFeatureDisabled => "configuration",
            HarnessError::Json(_) | HarnessError::Io(_) => "io",
            HarnessError::Connection(_) | HarnessError::MonitorStopped => "connection",
            HarnessError::ProtocolMismatch { .. } => "protocol",
            HarnessError::Timeout(_) => "timeout",
            HarnessError::UnknownCommand(_) => "unknown-command",
            HarnessError::UnknownCondition(_) => "unknown-condition",
            HarnessError::UnknownParameter(_) => "unknown-parameter",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(HarnessError::Configuration("no plans".into()).is_fatal());
        assert!(!HarnessError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!HarnessError::UnknownCommand("042".into()).is_fatal());
        assert!(!HarnessError::Connection("port busy".into()).is_fatal());
        assert!(!HarnessError::ProtocolMismatch {
            expected: "[sn_get+ok]".into(),
            actual: "[sn_get+err]".into(),
        }
        .is_fatal());
    }

    #[test]
    fn categories_name_the_failure_class() {
        assert_eq!(
            HarnessError::UnknownCondition("battery".into()).category(),
            "unknown-condition"
        );
        assert_eq!(HarnessError::MonitorStopped.category(), "connection");
        assert_eq!(
            HarnessError::Timeout(Duration::from_millis(500)).category(),
            "timeout"
        );
    }

    #[test]
    fn display_includes_context() {
        let err = HarnessError::ProtocolMismatch {
            expected: "[fw_get+ok]".into(),
            actual: "[fw_get+fail]".into(),
        };
        let text = err.to_string();
        assert!(text.contains("[fw_get+ok]"));
        assert!(text.contains("[fw_get+fail]"));
    }
}
