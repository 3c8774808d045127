//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for startup-time configuration errors and
//! [`RequestError`] for the per-request failures recorded during a run.

/// Errors that occur during load test configuration parsing, validation, or file I/O.
///
/// Every variant is fatal at startup: a run that fails with one of these
/// never spawns a virtual user.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., a zero-length stage).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// A threshold expression could not be parsed or does not apply to its metric.
    #[error("Invalid threshold '{metric}: {expression}': {message}")]
    Threshold {
        metric: String,
        expression: String,
        message: String,
    },
}

/// Per-request failures recorded by the metrics pipeline.
///
/// None of these stop a virtual user; they are counted and the worker moves
/// on to its next iteration.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum RequestError {
    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake,
    /// reset while reading the body).
    #[error("Network error: {message}")]
    Network { message: String },

    /// The request exceeded its timeout.
    #[error("Request timed out")]
    Timeout,

    /// The scenario itself returned an error or panicked.
    #[error("Scenario error: {message}")]
    Scenario { message: String },
}

impl RequestError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"network"`, `"timeout"`, `"scenario"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout => "timeout",
            Self::Scenario { .. } => "scenario",
        }
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`RequestError`] variant.
    ///
    /// Status errors never reach here: non-2xx responses are successful round
    /// trips whose status is judged by the metrics pipeline.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}
