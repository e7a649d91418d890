//! The job handler contract

use async_trait::async_trait;
use std::future::Future;

use crate::error::JobError;
use crate::types::{JobOutput, TaskDescriptor};

/// A unit of check-in work
///
/// Handlers own their session and credential state; the orchestrator only sees
/// the returned [`JobOutput`] or [`JobError`]. Handlers are not trusted to be
/// panic-free: a panic is recorded as a failed task like any other error.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use checkin_box::jobs::JobHandler;
/// use checkin_box::{JobError, JobOutput, RequestClient, TaskDescriptor};
///
/// struct Ping;
///
/// #[async_trait]
/// impl JobHandler for Ping {
///     async fn run(&self, _task: &TaskDescriptor) -> Result<JobOutput, JobError> {
///         let outcome = RequestClient::new().get("https://example.com/ping").await;
///         if outcome.success {
///             Ok(JobOutput::new("pong"))
///         } else {
///             Err(outcome.into())
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job once
    async fn run(&self, task: &TaskDescriptor) -> Result<JobOutput, JobError>;
}

/// Adapter turning an async closure into a [`JobHandler`]
///
/// Built through [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler
///
/// ```no_run
/// use checkin_box::jobs::{HandlerRegistry, handler_fn};
/// use checkin_box::{JobError, JobOutput};
///
/// let mut registry = HandlerRegistry::new();
/// registry.register(
///     "hello",
///     handler_fn(|task| async move { Ok::<_, JobError>(JobOutput::new(format!("hi from {}", task.name))) }),
/// );
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobOutput, JobError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(TaskDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobOutput, JobError>> + Send,
{
    async fn run(&self, task: &TaskDescriptor) -> Result<JobOutput, JobError> {
        (self.f)(task.clone()).await
    }
}
