//! Core types for checkin-box

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Result of one logical HTTP call, after any retries
///
/// A successful outcome always carries a 2xx status and no message. A failed
/// outcome always carries a non-empty message; `status` is `None` when no
/// response was ever received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Whether the call succeeded
    pub success: bool,
    /// HTTP status of the last response (None = no response received)
    pub status: Option<u16>,
    /// Response payload (JSON when the body parses, otherwise a string)
    pub data: Option<serde_json::Value>,
    /// Human-readable diagnostic for failures
    pub message: Option<String>,
    /// Number of retries performed on top of the initial attempt
    pub retries_used: u32,
}

impl RequestOutcome {
    /// Build a successful outcome
    pub fn success(status: u16, data: Option<serde_json::Value>, retries_used: u32) -> Self {
        Self {
            success: true,
            status: Some(status),
            data,
            message: None,
            retries_used,
        }
    }

    /// Build a failed outcome
    pub fn failure(status: Option<u16>, message: impl Into<String>, retries_used: u32) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "request failed".to_string()
        } else {
            message
        };
        Self {
            success: false,
            status,
            data: None,
            message: Some(message),
            retries_used,
        }
    }

    /// Look up a field of a JSON object payload
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}

/// What a job handler hands back on success
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobOutput {
    /// Human-readable log of what the job did
    pub message: String,
    /// Ask the orchestrator to raise a fast alert for this result
    pub urgent: bool,
}

impl JobOutput {
    /// A regular result
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            urgent: false,
        }
    }

    /// A result that completed but needs a human to look at it
    pub fn urgent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            urgent: true,
        }
    }
}

impl From<String> for JobOutput {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobOutput {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Identifies one job of a run and carries the shared configuration
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
    /// Task name, the key used to resolve the handler
    pub name: String,
    /// Shared, read-only configuration
    pub config: Arc<Config>,
}

impl TaskDescriptor {
    /// Create a descriptor for `name`
    pub fn new(name: impl Into<String>, config: Arc<Config>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// The configuration section named after this task, if any
    pub fn section(&self) -> Option<&serde_json::Value> {
        self.config.section(&self.name)
    }
}

/// Outcome of one job in a batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Name of the task as requested by the caller
    pub task_name: String,
    /// Whether the job completed without error
    pub success: bool,
    /// Log produced by the handler, or the error text
    pub message: String,
    /// When the result was recorded
    pub timestamp: DateTime<Utc>,
    /// Whether a fast alert was raised for this result
    #[serde(default)]
    pub urgent: bool,
    /// Wall-clock time the job took, in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
}

impl TaskResult {
    /// Record a successful job
    pub fn succeeded(task_name: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::build(task_name.into(), true, message.into(), elapsed)
    }

    /// Record a failed job
    pub fn failed(task_name: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::build(task_name.into(), false, message.into(), elapsed)
    }

    fn build(task_name: String, success: bool, message: String, elapsed: Duration) -> Self {
        Self {
            task_name,
            success,
            message,
            timestamp: Utc::now(),
            urgent: false,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Mark the result as having raised a fast alert
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }
}

/// The full outcome of one run, in the order the tasks were requested
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    results: Vec<TaskResult>,
    success_count: usize,
    failure_count: usize,
    /// When the batch started
    pub started_at: DateTime<Utc>,
    /// When the last job settled
    pub finished_at: DateTime<Utc>,
}

impl BatchResult {
    /// Aggregate settled results; counts are derived here and never updated afterwards
    pub fn new(results: Vec<TaskResult>, started_at: DateTime<Utc>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        Self {
            results,
            success_count,
            failure_count,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Per-task results in input order
    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    /// Number of successful tasks
    pub fn success_count(&self) -> usize {
        self.success_count
    }

    /// Number of failed tasks
    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// Total number of tasks
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True when the batch had no tasks
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// First result recorded for `task_name`
    pub fn get(&self, task_name: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_name == task_name)
    }

    /// True when every task succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }
}

/// Events emitted by the orchestrator
///
/// Consumers subscribe through
/// [`TaskOrchestrator::subscribe`](crate::orchestrator::TaskOrchestrator::subscribe).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run started
    BatchStarted {
        /// Number of tasks requested
        total: usize,
    },
    /// A job was handed to its handler
    TaskStarted {
        /// Task name
        task_name: String,
    },
    /// A job settled
    TaskFinished {
        /// The recorded result
        result: TaskResult,
    },
    /// A fast alert was raised
    Alert {
        /// Task name
        task_name: String,
        /// Alert text
        message: String,
    },
    /// All jobs settled
    BatchFinished {
        /// Number of successful tasks
        succeeded: usize,
        /// Number of failed tasks
        failed: usize,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_outcome_never_has_empty_message() {
        let outcome = RequestOutcome::failure(None, "  ", 2);
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("request failed"));
        assert_eq!(outcome.retries_used, 2);
    }

    #[test]
    fn success_outcome_carries_status_and_no_message() {
        let outcome = RequestOutcome::success(200, Some(serde_json::json!({"ok": true})), 0);
        assert!(outcome.success);
        assert_eq!(outcome.status, Some(200));
        assert!(outcome.message.is_none());
        assert_eq!(outcome.field("ok"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn batch_counts_are_derived_from_results() {
        let results = vec![
            TaskResult::succeeded("a", "ok", Duration::from_millis(5)),
            TaskResult::failed("b", "boom", Duration::ZERO),
            TaskResult::failed("c", "not found", Duration::ZERO),
        ];
        let batch = BatchResult::new(results, Utc::now());

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.success_count(), 1);
        assert_eq!(batch.failure_count(), 2);
        assert!(!batch.all_succeeded());
        assert_eq!(batch.get("a").unwrap().duration_ms, 5);
    }

    #[test]
    fn empty_batch() {
        let batch = BatchResult::new(Vec::new(), Utc::now());
        assert!(batch.is_empty());
        assert!(batch.all_succeeded());
        assert_eq!(batch.failure_count(), 0);
    }

    #[test]
    fn job_output_conversions() {
        assert_eq!(JobOutput::from("done"), JobOutput::new("done"));
        assert!(JobOutput::urgent("cookie expired").urgent);
        assert!(!JobOutput::from(String::from("fine")).urgent);
    }
}
