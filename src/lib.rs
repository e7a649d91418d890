//! # checkin-box
//!
//! Batch runner for scheduled daily check-in jobs.
//!
//! ## Design Philosophy
//!
//! checkin-box is designed to be:
//! - **Isolated** - One job failing, hanging or panicking never affects the others
//! - **Resilient** - Every outbound request goes through a shared retry/timeout layer
//! - **Config-driven** - Task lists, retry policy, concurrency and push channels come from YAML
//! - **Event-driven** - Consumers can subscribe to batch events as they happen
//!
//! ## Quick Start
//!
//! ```no_run
//! use checkin_box::jobs::{HandlerRegistry, handler_fn};
//! use checkin_box::{Config, JobError, JobOutput, RequestClient, TaskOrchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::from_yaml_str("cbList: ping\n")?);
//!
//!     let mut registry = HandlerRegistry::from_config(&config)?;
//!     registry.register(
//!         "ping",
//!         handler_fn(|_| async {
//!             let outcome = RequestClient::new().get("https://example.com/ping").await;
//!             if outcome.success {
//!                 Ok(JobOutput::new("pong"))
//!             } else {
//!                 Err(JobError::from(outcome))
//!             }
//!         }),
//!     );
//!
//!     let orchestrator = TaskOrchestrator::from_config(registry, &config.runner)?;
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let batch = orchestrator
//!         .run_all(config.cb_list.names().to_vec(), config.clone())
//!         .await;
//!     println!("{} succeeded, {} failed", batch.success_count(), batch.failure_count());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types and loading
pub mod config;
/// Error types
pub mod error;
/// Job handlers and registry
pub mod jobs;
/// Report and alert delivery
pub mod notify;
/// Batch orchestration
pub mod orchestrator;
/// Resilient HTTP request layer
pub mod request;
/// Retry logic with configurable backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{ConcurrencyMode, Config, RetryPolicy};
pub use error::{Error, JobError, Result};
pub use jobs::{HandlerRegistry, JobHandler};
pub use notify::{Dispatcher, Notifier};
pub use orchestrator::TaskOrchestrator;
pub use request::{Body, RequestClient};
pub use types::{BatchResult, Event, JobOutput, RequestOutcome, TaskDescriptor, TaskResult};

/// Wait for a termination signal.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// The binary races this against the batch so an interrupted run still logs
/// before exiting.
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
pub async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
    }
}
