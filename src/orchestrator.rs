//! Batch orchestration
//!
//! [`TaskOrchestrator::run_all`] resolves each requested task name against the
//! [`HandlerRegistry`], runs the handlers under the configured
//! [`ConcurrencyMode`], and returns one [`TaskResult`] per requested name in the
//! order the names were given.
//!
//! Every job runs on its own tokio task. Errors, panics, timeouts and unknown
//! names all become failed results; nothing a handler does can abort the batch.
//!
//! # Example
//!
//! ```no_run
//! use checkin_box::jobs::{HandlerRegistry, handler_fn};
//! use checkin_box::{Config, JobError, JobOutput, TaskOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mut registry = HandlerRegistry::new();
//! registry.register("a", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("done")) }));
//!
//! let orchestrator = TaskOrchestrator::new(registry);
//! let batch = orchestrator.run_all(["a", "missing"], Arc::new(Config::default())).await;
//! assert_eq!(batch.success_count(), 1);
//! assert_eq!(batch.failure_count(), 1);
//! # }
//! ```

use chrono::Utc;
use futures::StreamExt;
use futures::future::join_all;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::config::{Config, ConcurrencyMode, RunnerConfig};
use crate::error::{Error, JobError, Result};
use crate::jobs::HandlerRegistry;
use crate::notify::Notifier;
use crate::types::{BatchResult, Event, TaskDescriptor, TaskResult};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runs batches of jobs
pub struct TaskOrchestrator {
    registry: Arc<HandlerRegistry>,
    mode: ConcurrencyMode,
    job_timeout: Option<Duration>,
    distress: Option<Regex>,
    alert_on_failure: bool,
    alerts: Option<Arc<dyn Notifier>>,
    event_tx: broadcast::Sender<Event>,
}

impl TaskOrchestrator {
    /// Orchestrator with the default runner settings
    pub fn new(registry: HandlerRegistry) -> Self {
        let defaults = RunnerConfig::default();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(registry),
            mode: defaults.concurrency,
            job_timeout: defaults.job_timeout,
            distress: compile_distress(&defaults.distress_pattern).ok().flatten(),
            alert_on_failure: defaults.alert_on_failure,
            alerts: None,
            event_tx,
        }
    }

    /// Orchestrator configured from the `runner` section
    pub fn from_config(registry: HandlerRegistry, runner: &RunnerConfig) -> Result<Self> {
        Ok(Self::new(registry)
            .concurrency(runner.concurrency.clone())?
            .job_timeout(runner.job_timeout)
            .distress_pattern(&runner.distress_pattern)?
            .alert_on_failure(runner.alert_on_failure))
    }

    /// Set the scheduling mode
    pub fn concurrency(mut self, mode: ConcurrencyMode) -> Result<Self> {
        if mode.width() == Some(0) {
            return Err(Error::config(
                "concurrency width must be at least 1",
                "runner.concurrency.width",
            ));
        }
        self.mode = mode;
        Ok(self)
    }

    /// Cap each job's run time (None = wait for every job to settle)
    pub fn job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Pattern that turns a successful message into a fast alert; empty disables the check
    pub fn distress_pattern(mut self, pattern: &str) -> Result<Self> {
        self.distress = compile_distress(pattern)?;
        Ok(self)
    }

    /// Whether failed jobs raise a fast alert too
    pub fn alert_on_failure(mut self, enabled: bool) -> Self {
        self.alert_on_failure = enabled;
        self
    }

    /// Where fast alerts are sent
    pub fn alert_sink(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.alerts = Some(notifier);
        self
    }

    /// Subscribe to orchestration events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The scheduling mode in use
    pub fn mode(&self) -> &ConcurrencyMode {
        &self.mode
    }

    /// Run every named task and aggregate the results in input order
    pub async fn run_all<I, S>(&self, task_names: I, config: Arc<Config>) -> BatchResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let started_at = Utc::now();
        let names: Vec<String> = task_names.into_iter().map(Into::into).collect();
        self.event_tx
            .send(Event::BatchStarted { total: names.len() })
            .ok();
        tracing::info!(total = names.len(), mode = ?self.mode, "batch started");

        let results: Vec<TaskResult> = match &self.mode {
            ConcurrencyMode::Unbounded => join_all(self.jobs(names, &config)).await,
            ConcurrencyMode::Sliding { width } => {
                futures::stream::iter(self.jobs(names, &config))
                    .buffered((*width).max(1))
                    .collect()
                    .await
            }
            ConcurrencyMode::Windowed { width, pause } => {
                let mut results = Vec::with_capacity(names.len());
                for (i, window) in names.chunks((*width).max(1)).enumerate() {
                    if i > 0 && !pause.is_zero() {
                        tracing::debug!(window = i, pause_ms = pause.as_millis(), "pausing before next window");
                        tokio::time::sleep(*pause).await;
                    }
                    results.extend(join_all(self.jobs(window.to_vec(), &config)).await);
                }
                results
            }
        };

        let batch = BatchResult::new(results, started_at);
        tracing::info!(
            succeeded = batch.success_count(),
            failed = batch.failure_count(),
            "batch finished"
        );
        self.event_tx
            .send(Event::BatchFinished {
                succeeded: batch.success_count(),
                failed: batch.failure_count(),
            })
            .ok();
        batch
    }

    /// One pending job per name, in order
    fn jobs(
        &self,
        names: Vec<String>,
        config: &Arc<Config>,
    ) -> Vec<impl Future<Output = TaskResult> + Send + '_> {
        names
            .into_iter()
            .map(|name| self.run_one(name, config.clone()))
            .collect()
    }

    /// Run one job behind the isolation boundary; always yields a result
    async fn run_one(&self, name: String, config: Arc<Config>) -> TaskResult {
        let start = Instant::now();

        let result = if name.trim().is_empty() {
            TaskResult::failed(name, "invalid task name: the name is empty", start.elapsed())
                .with_urgent(self.alert_on_failure)
        } else if let Some(handler) = self.registry.resolve(&name) {
            self.event_tx
                .send(Event::TaskStarted {
                    task_name: name.clone(),
                })
                .ok();

            let task = TaskDescriptor::new(name.clone(), config);
            let timeout = self.job_timeout;
            let joined = tokio::spawn(async move {
                let run = handler.run(&task);
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, run)
                        .await
                        .unwrap_or(Err(JobError::Timeout(limit))),
                    None => run.await,
                }
            })
            .await;

            match joined {
                Ok(Ok(output)) => {
                    let urgent = output.urgent || self.is_distressed(&output.message);
                    TaskResult::succeeded(name, output.message, start.elapsed()).with_urgent(urgent)
                }
                Ok(Err(e)) => TaskResult::failed(name.clone(), format!("{name} failed: {e}"), start.elapsed())
                    .with_urgent(self.alert_on_failure),
                Err(e) if e.is_panic() => {
                    let reason = panic_message(e.into_panic());
                    TaskResult::failed(name.clone(), format!("{name} panicked: {reason}"), start.elapsed())
                        .with_urgent(self.alert_on_failure)
                }
                Err(_) => TaskResult::failed(name.clone(), format!("{name} was cancelled"), start.elapsed())
                    .with_urgent(self.alert_on_failure),
            }
        } else {
            TaskResult::failed(
                name.clone(),
                format!("task {name} not found: no handler is registered under that name"),
                start.elapsed(),
            )
            .with_urgent(self.alert_on_failure)
        };

        if result.success {
            tracing::info!(task = %result.task_name, duration_ms = result.duration_ms, message = %result.message, "task succeeded");
        } else {
            tracing::warn!(task = %result.task_name, duration_ms = result.duration_ms, message = %result.message, "task failed");
        }

        if result.urgent {
            self.raise_alert(&result).await;
        }

        self.event_tx
            .send(Event::TaskFinished {
                result: result.clone(),
            })
            .ok();
        result
    }

    fn is_distressed(&self, message: &str) -> bool {
        self.distress.as_ref().is_some_and(|re| re.is_match(message))
    }

    async fn raise_alert(&self, result: &TaskResult) {
        self.event_tx
            .send(Event::Alert {
                task_name: result.task_name.clone(),
                message: result.message.clone(),
            })
            .ok();

        let Some(notifier) = self.alerts.clone() else {
            return;
        };
        // the sink runs on its own task so a panicking notifier cannot take the batch down
        let title = format!("Check-in alert: {}", result.task_name);
        let message = result.message.clone();
        let sent = tokio::spawn(async move { notifier.notify(&title, &message, None).await }).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(task = %result.task_name, error = %e, "failed to send alert");
            }
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                tracing::error!(task = %result.task_name, %reason, "alert sink panicked");
            }
            Err(e) => {
                tracing::warn!(task = %result.task_name, error = %e, "alert was cancelled");
            }
        }
    }
}

fn compile_distress(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| Error::config(format!("invalid distress pattern: {e}"), "runner.distress_pattern"))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler_fn;
    use crate::types::JobOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, title: &str, message: &str, _details: Option<&BatchResult>) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn scenario_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("a", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("a done")) }));
        registry.register(
            "b",
            handler_fn(|_| async { Err::<JobOutput, _>(JobError::Other("endpoint exploded".into())) }),
        );
        registry
    }

    #[tokio::test]
    async fn mixed_batch_scenario() {
        let orchestrator = TaskOrchestrator::new(scenario_registry());
        let batch = orchestrator.run_all(["a", "b", "missing"], config()).await;

        let results = batch.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].task_name, "a");
        assert!(results[0].success);
        assert_eq!(results[0].message, "a done");
        assert_eq!(results[1].task_name, "b");
        assert!(!results[1].success);
        assert!(results[1].message.contains("endpoint exploded"));
        assert_eq!(results[2].task_name, "missing");
        assert!(!results[2].success);
        assert!(results[2].message.contains("not found"));
        assert_eq!(batch.success_count(), 1);
        assert_eq!(batch.failure_count(), 2);
    }

    #[tokio::test]
    async fn empty_task_list_yields_empty_batch() {
        let orchestrator = TaskOrchestrator::new(scenario_registry());
        let batch = orchestrator.run_all(Vec::<String>::new(), config()).await;
        assert!(batch.is_empty());
        assert_eq!(batch.success_count(), 0);
    }

    #[tokio::test]
    async fn order_follows_input_not_completion() {
        let mut registry = HandlerRegistry::new();
        for (name, delay) in [("slow", 60u64), ("medium", 30), ("fast", 1)] {
            registry.register(
                name,
                handler_fn(move |task| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, JobError>(JobOutput::new(task.name))
                }),
            );
        }

        for mode in [
            ConcurrencyMode::Unbounded,
            ConcurrencyMode::Sliding { width: 2 },
            ConcurrencyMode::Windowed {
                width: 2,
                pause: Duration::from_millis(5),
            },
        ] {
            let orchestrator = TaskOrchestrator::new(registry.clone()).concurrency(mode).unwrap();
            let batch = orchestrator.run_all(["slow", "medium", "fast"], config()).await;
            let names: Vec<_> = batch.results().iter().map(|r| r.message.as_str()).collect();
            assert_eq!(names, ["slow", "medium", "fast"]);
        }
    }

    fn width_tracking_registry(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "tracked",
            handler_fn(move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, JobError>(JobOutput::new("ok"))
                }
            }),
        );
        registry
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bounded_modes_never_exceed_width() {
        for mode in [
            ConcurrencyMode::Sliding { width: 3 },
            ConcurrencyMode::Windowed {
                width: 3,
                pause: Duration::ZERO,
            },
        ] {
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let orchestrator = TaskOrchestrator::new(width_tracking_registry(active.clone(), peak.clone()))
                .concurrency(mode.clone())
                .unwrap();

            let batch = orchestrator.run_all(vec!["tracked"; 10], config()).await;

            assert_eq!(batch.success_count(), 10);
            let peak = peak.load(Ordering::SeqCst);
            assert!(peak <= 3, "{mode:?} ran {peak} jobs at once");
            assert!(peak >= 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unbounded_mode_runs_jobs_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let orchestrator = TaskOrchestrator::new(width_tracking_registry(active, peak.clone()));

        let started = Instant::now();
        let batch = orchestrator.run_all(vec!["tracked"; 8], config()).await;

        assert!(batch.all_succeeded());
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(started.elapsed() < Duration::from_millis(8 * 20));
    }

    #[tokio::test]
    async fn windowed_mode_pauses_between_windows() {
        let orchestrator = TaskOrchestrator::new(scenario_registry())
            .concurrency(ConcurrencyMode::Windowed {
                width: 1,
                pause: Duration::from_millis(30),
            })
            .unwrap();

        let started = Instant::now();
        let batch = orchestrator.run_all(["a", "a", "a"], config()).await;

        assert_eq!(batch.success_count(), 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let mut registry = scenario_registry();
        registry.register(
            "boom",
            handler_fn(|_| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, JobError>(JobOutput::new("unreachable"))
            }),
        );

        let batch = TaskOrchestrator::new(registry)
            .run_all(["boom", "a"], config())
            .await;

        assert!(!batch.results()[0].success);
        assert!(batch.results()[0].message.contains("handler bug"));
        assert!(batch.results()[1].success);
    }

    #[tokio::test]
    async fn job_timeout_marks_task_failed() {
        let mut registry = scenario_registry();
        registry.register(
            "hang",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, JobError>(JobOutput::new("late"))
            }),
        );

        let batch = TaskOrchestrator::new(registry)
            .job_timeout(Some(Duration::from_millis(20)))
            .run_all(["hang", "a"], config())
            .await;

        assert!(!batch.results()[0].success);
        assert!(batch.results()[0].message.contains("timed out"));
        assert!(batch.results()[1].success);
    }

    #[tokio::test]
    async fn blank_task_name_is_recorded_as_failure() {
        let batch = TaskOrchestrator::new(scenario_registry())
            .run_all(["a", "  "], config())
            .await;

        assert_eq!(batch.len(), 2);
        assert!(!batch.results()[1].success);
        assert!(batch.results()[1].message.contains("invalid task name"));
        assert!(batch.results()[1].urgent);
    }

    #[tokio::test]
    async fn blank_task_name_raises_alert() {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = TaskOrchestrator::new(scenario_registry()).alert_sink(notifier.clone());

        orchestrator.run_all([""], config()).await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("invalid task name"));
    }

    struct PanickingNotifier;

    #[async_trait]
    impl Notifier for PanickingNotifier {
        async fn notify(&self, _title: &str, _message: &str, _details: Option<&BatchResult>) -> Result<()> {
            panic!("alert sink exploded");
        }
    }

    #[tokio::test]
    async fn panicking_alert_sink_is_contained() {
        let orchestrator = TaskOrchestrator::new(scenario_registry()).alert_sink(Arc::new(PanickingNotifier));

        let batch = orchestrator.run_all(["a", "missing", "b"], config()).await;

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.success_count(), 1);
        assert_eq!(batch.failure_count(), 2);
        assert!(batch.results()[1].urgent);
    }

    #[tokio::test]
    async fn batch_runs_on_a_spawned_task() {
        for mode in [
            ConcurrencyMode::Unbounded,
            ConcurrencyMode::Sliding { width: 2 },
            ConcurrencyMode::Windowed {
                width: 1,
                pause: Duration::ZERO,
            },
        ] {
            let orchestrator = Arc::new(TaskOrchestrator::new(scenario_registry()).concurrency(mode).unwrap());
            let batch = tokio::spawn({
                let orchestrator = orchestrator.clone();
                async move {
                    orchestrator
                        .run_all(vec!["a".to_string(), "missing".to_string()], config())
                        .await
                }
            })
            .await
            .unwrap();

            assert_eq!(batch.success_count(), 1);
            assert_eq!(batch.get("missing").map(|r| r.success), Some(false));
        }
    }

    #[tokio::test]
    async fn distress_marker_and_urgent_flag_raise_alerts() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "expired",
            handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("Cookie expired, please log in again")) }),
        );
        registry.register(
            "flagged",
            handler_fn(|_| async { Ok::<_, JobError>(JobOutput::urgent("reward not claimed")) }),
        );
        registry.register("quiet", handler_fn(|_| async { Ok::<_, JobError>(JobOutput::new("all good")) }));

        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = TaskOrchestrator::new(registry).alert_sink(notifier.clone());
        let batch = orchestrator
            .run_all(["expired", "flagged", "quiet"], config())
            .await;

        assert!(batch.all_succeeded());
        assert!(batch.results()[0].urgent);
        assert!(batch.results()[1].urgent);
        assert!(!batch.results()[2].urgent);

        let mut titles: Vec<_> = notifier.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
        titles.sort();
        assert_eq!(titles, ["Check-in alert: expired", "Check-in alert: flagged"]);
    }

    #[tokio::test]
    async fn failure_alerts_can_be_disabled() {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = TaskOrchestrator::new(scenario_registry())
            .alert_on_failure(false)
            .distress_pattern("")
            .unwrap()
            .alert_sink(notifier.clone());

        let batch = orchestrator.run_all(["b", "missing"], config()).await;

        assert_eq!(batch.failure_count(), 2);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_alert_by_default() {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = TaskOrchestrator::new(scenario_registry()).alert_sink(notifier.clone());

        orchestrator.run_all(["b"], config()).await;

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("endpoint exploded"));
    }

    #[tokio::test]
    async fn repeated_runs_are_consistent() {
        let orchestrator = TaskOrchestrator::new(scenario_registry());
        let first = orchestrator.run_all(["a", "b", "missing"], config()).await;
        let second = orchestrator.run_all(["a", "b", "missing"], config()).await;

        let flags = |b: &BatchResult| b.results().iter().map(|r| r.success).collect::<Vec<_>>();
        assert_eq!(flags(&first), flags(&second));
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let orchestrator = TaskOrchestrator::new(scenario_registry());
        let mut events = orchestrator.subscribe();

        orchestrator.run_all(["a"], config()).await;

        assert!(matches!(events.recv().await.unwrap(), Event::BatchStarted { total: 1 }));
        assert!(matches!(events.recv().await.unwrap(), Event::TaskStarted { ref task_name } if task_name == "a"));
        assert!(matches!(events.recv().await.unwrap(), Event::TaskFinished { ref result } if result.success));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::BatchFinished { succeeded: 1, failed: 0 }
        ));
    }

    #[tokio::test]
    async fn handlers_see_shared_config() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "reader",
            handler_fn(|task| async move {
                let token = task
                    .section()
                    .and_then(|s| s.get("token"))
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| JobError::MissingCredentials(task.name.clone()))?
                    .to_string();
                Ok::<_, JobError>(JobOutput::new(format!("token {token}")))
            }),
        );

        let config = Arc::new(Config::from_yaml_str("reader:\n  token: xyz\n").unwrap());
        let batch = TaskOrchestrator::new(registry).run_all(["reader"], config).await;

        assert_eq!(batch.results()[0].message, "token xyz");
    }

    #[test]
    fn rejects_zero_width_and_bad_pattern() {
        assert!(
            TaskOrchestrator::new(HandlerRegistry::new())
                .concurrency(ConcurrencyMode::Sliding { width: 0 })
                .is_err()
        );
        assert!(
            TaskOrchestrator::new(HandlerRegistry::new())
                .distress_pattern("(")
                .is_err()
        );
    }

    #[test]
    fn from_config_applies_runner_section() {
        let runner = RunnerConfig {
            concurrency: ConcurrencyMode::Sliding { width: 2 },
            ..Default::default()
        };
        let orchestrator = TaskOrchestrator::from_config(HandlerRegistry::new(), &runner).unwrap();
        assert_eq!(orchestrator.mode(), &ConcurrencyMode::Sliding { width: 2 });
    }
}
