//! Error types for the monitoring engine.

use thiserror::Error;

/// Errors raised while compiling patterns, parsing settings or applying a
/// configuration.
///
/// None of these are produced on the timer hot path: `start`, `stop` and
/// `abort` never fail.
#[derive(Debug, Error)]
pub enum PerfMonError {
    /// An appender pattern could not be parsed.
    #[error("Invalid appender pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// No factory is registered for an appender class.
    #[error("Unknown appender class: {0}")]
    UnknownAppenderClass(String),

    /// A binding or trace references an appender alias that was not defined.
    #[error("Unknown appender: {0}")]
    UnknownAppender(String),

    /// A monitor name is empty, has empty segments or contains whitespace.
    #[error("Invalid monitor name: {0:?}")]
    InvalidMonitorName(String),

    /// A duration or duration list could not be parsed.
    #[error("Invalid duration: {0:?}")]
    InvalidDuration(String),

    /// An appender attribute is missing or malformed.
    #[error("Invalid attribute {attribute:?} on appender {appender}: {reason}")]
    InvalidAppenderAttribute {
        appender: String,
        attribute: String,
        reason: String,
    },

    /// Loading a configuration file failed.
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PerfMonError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        PerfMonError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = PerfMonError> = std::result::Result<T, E>;
