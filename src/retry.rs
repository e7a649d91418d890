//! Retry loop with a configurable delay between attempts
//!
//! The delay is fixed by default; [`Backoff::Exponential`](crate::config::Backoff)
//! switches to a growing, capped delay. Jitter is opt-in.
//!
//! # Example
//!
//! ```no_run
//! use checkin_box::retry::{IsRetryable, with_retry};
//! use checkin_box::config::RetryPolicy;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let policy = RetryPolicy::default();
//! let outcome = with_retry(&policy, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! })
//! .await;
//! outcome.result?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryPolicy;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, unreachable hosts, overloaded upstreams) should return `true`.
/// Permanent failures (rejected credentials, malformed requests) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s.is_server_error() || s == reqwest::StatusCode::REQUEST_TIMEOUT
                    })
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Notification(_) => false,
            Error::Config { .. }
            | Error::Serialization(_)
            | Error::Yaml(_)
            | Error::InvalidTaskList(_)
            | Error::Other(_) => false,
        }
    }
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Result of the last attempt
    pub result: Result<T, E>,
    /// Retries performed on top of the initial attempt
    pub retries: u32,
}

/// Execute an async operation, retrying transient failures per `policy`
///
/// The operation runs once, then up to `policy.max_retries` more times while it
/// keeps failing with a retryable error. Only the last attempt's result is returned.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(result),
                    retries,
                };
            }
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries);
                let delay = if policy.jitter { add_jitter(delay) } else { delay };

                tracing::warn!(
                    error = %e,
                    retry = retries,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    "attempt failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = retries + 1,
                        "operation failed after all retries were exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return RetryOutcome {
                    result: Err(e),
                    retries,
                };
            }
        }
    }
}

/// Add random jitter to a delay
///
/// The actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
