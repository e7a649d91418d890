//! Error types for checkin-box
//!
//! Two layers of errors live here:
//! - [`Error`] covers everything outside a job: configuration loading, task list
//!   parsing, notification delivery.
//! - [`JobError`] is what a job handler returns. The orchestrator converts every
//!   one of them into a failed [`TaskResult`](crate::types::TaskResult), so a
//!   `JobError` never travels past the batch boundary.

use std::time::Duration;
use thiserror::Error;

use crate::types::RequestOutcome;

/// Result type alias for checkin-box operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for checkin-box
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "cbList")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The task list could not be interpreted
    #[error("invalid task list: {0}")]
    InvalidTaskList(String),

    /// A notification channel rejected or failed to deliver a message
    #[error("notification error: {0}")]
    Notification(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// Errors raised by job handlers
///
/// The message of every variant is what ends up in the batch report, so it should
/// be enough for a human to tell an expired credential from an endpoint outage.
#[derive(Debug, Error)]
pub enum JobError {
    /// No usable credential was configured for the job
    #[error("no valid credentials configured for {0}")]
    MissingCredentials(String),

    /// A request issued by the job failed
    #[error("request failed{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Request {
        /// Last HTTP status seen, if any response arrived
        status: Option<u16>,
        /// Diagnostic from the request layer
        message: String,
    },

    /// The job's own configuration section is unusable
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// The job did not settle within the per-job timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else a handler wants to report
    #[error("{0}")]
    Other(String),
}

impl From<RequestOutcome> for JobError {
    fn from(outcome: RequestOutcome) -> Self {
        JobError::Request {
            status: outcome.status,
            message: outcome
                .message
                .unwrap_or_else(|| "request failed without a diagnostic".to_string()),
        }
    }
}

impl From<Error> for JobError {
    fn from(e: Error) -> Self {
        JobError::Other(e.to_string())
    }
}
