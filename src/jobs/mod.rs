//! Job handlers and the name → handler registry
//!
//! The orchestrator never loads code by name at runtime. Instead every handler
//! is registered up front under its task name:
//!
//! - [`JobHandler`]: the contract every job satisfies
//! - [`HttpCheckinJob`]: a job fully described by a `jobs:` entry in the configuration
//! - [`handler_fn`]: adapter for ad-hoc async closures
//!
//! ## Usage
//!
//! ```no_run
//! use checkin_box::jobs::{HandlerRegistry, handler_fn};
//! use checkin_box::{Config, JobError, JobOutput};
//!
//! let config = Config::default();
//! let mut registry = HandlerRegistry::from_config(&config).unwrap();
//! registry.register("noop", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("nothing to do")) }));
//! assert!(registry.contains("noop"));
//! ```

mod http_checkin;
mod traits;

pub use http_checkin::HttpCheckinJob;
pub use traits::{FnHandler, JobHandler, handler_fn};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;

/// Maps task names to handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every `jobs:` entry of `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (name, job) in &config.jobs {
            registry.register(name.clone(), HttpCheckinJob::from_config(name, job, &config.request)?);
        }
        Ok(registry)
    }

    /// Register `handler` under `name`, returning the handler it replaces
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Option<Arc<dyn JobHandler>> {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register an already shared handler
    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let name = name.into();
        let previous = self.handlers.insert(name.clone(), handler);
        if previous.is_some() {
            tracing::warn!(task = %name, "handler replaced by a later registration");
        }
        previous
    }

    /// Handler registered under `name`
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether `name` has a handler
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::types::{JobOutput, TaskDescriptor};

    #[tokio::test]
    async fn registered_closure_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "greet",
            handler_fn(|task| async move { Ok::<_, JobError>(JobOutput::new(format!("hello {}", task.name))) }),
        );

        let handler = registry.resolve("greet").unwrap();
        let output = handler
            .run(&TaskDescriptor::new("greet", Arc::new(Config::default())))
            .await
            .unwrap();
        assert_eq!(output.message, "hello greet");
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn later_registration_replaces_earlier_one() {
        let mut registry = HandlerRegistry::new();
        let first = registry.register("a", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("1")) }));
        let second = registry.register("a", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("2")) }));

        assert!(first.is_none());
        assert!(second.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn from_config_registers_http_jobs() {
        let config = Config::from_yaml_str(
            "jobs:\n  b:\n    url: https://example.com/b\n  a:\n    url: https://example.com/a\n",
        )
        .unwrap();
        let registry = HandlerRegistry::from_config(&config).unwrap();

        assert_eq!(registry.names(), ["a", "b"]);
        assert!(!registry.is_empty());
    }
}
