//! checkin-box binary
//!
//! Loads the configuration, resolves which tasks to run, runs them as one
//! batch and pushes the report.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use checkin_box::config::{
    ConcurrencyMode, Config, ConfigSource, PUSH_CONFIG_ENV, TASK_LIST_ENV, load_config,
    resolve_task_list,
};
use checkin_box::notify::send_report;
use checkin_box::{Dispatcher, Error, HandlerRegistry, Result, TaskOrchestrator, wait_for_signal};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code for a run stopped by SIGINT/SIGTERM
const INTERRUPTED: u8 = 130;

/// Variable holding the log filter
const LOG_ENV: &str = "RUST_LOG";

const DEFAULT_LOG_DIRECTIVES: &str = "info,checkin_box=info";

/// Log filter: the process environment first, then the `.env` file, then the default
fn log_directives(process: Option<String>, env_file: Option<&Path>) -> String {
    process
        .filter(|d| !d.trim().is_empty())
        .or_else(|| env_file.and_then(|path| dotenv_value(path, LOG_ENV)))
        .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVES.to_string())
}

fn dotenv_value(path: &Path, key: &str) -> Option<String> {
    dotenvy::from_path_iter(path)
        .ok()?
        .filter_map(|item| item.ok())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

#[derive(Parser, Debug)]
#[command(name = "checkin-box", version, about = "Run daily check-in jobs as one batch")]
struct Cli {
    /// Tasks to run; overrides the cbList environment variable and config entry
    tasks: Vec<String>,

    /// Configuration file (default: $ycurl, then $QL_DIR/data/config/config.yml, then ./config.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run at most N jobs at once, starting the next as soon as one finishes
    #[arg(long, value_name = "N", conflicts_with = "window")]
    concurrency: Option<usize>,

    /// Run jobs in fixed windows of N, waiting for each window to finish
    #[arg(long, value_name = "N")]
    window: Option<usize>,

    /// Pause between windows, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0, requires = "window")]
    pause_ms: u64,

    /// Never send the end-of-batch report
    #[arg(long)]
    no_push: bool,
}

impl Cli {
    fn concurrency_mode(&self) -> Option<ConcurrencyMode> {
        if let Some(width) = self.window {
            return Some(ConcurrencyMode::Windowed {
                width,
                pause: Duration::from_millis(self.pause_ms),
            });
        }
        self.concurrency.map(|width| ConcurrencyMode::Sliding { width })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is loaded before the filter is built so RUST_LOG set there applies
    let env_file = dotenvy::dotenv().ok();
    let directives = log_directives(std::env::var(LOG_ENV).ok(), env_file.as_deref());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(directives))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "check-in run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let source = match &cli.config {
        Some(path) => ConfigSource::File(path.clone()),
        None => ConfigSource::from_env()?,
    };

    let (mut config, config_error) = match load_config(&source).await {
        Ok(config) => (config, None),
        Err(e) => {
            tracing::error!(source = ?source, error = %e, "could not load configuration, continuing with defaults");
            (Config::default(), Some(e))
        }
    };

    if let Ok(raw) = std::env::var(PUSH_CONFIG_ENV) {
        match config.apply_push_override(&raw) {
            Ok(()) => tracing::info!("push settings taken from {PUSH_CONFIG_ENV}"),
            Err(e) => tracing::warn!(error = %e, "ignoring invalid {PUSH_CONFIG_ENV}"),
        }
    }
    if let Some(mode) = cli.concurrency_mode() {
        config.runner.concurrency = mode;
    }

    let env_list = std::env::var(TASK_LIST_ENV).ok();
    let tasks = resolve_task_list(&cli.tasks, env_list.as_deref(), Some(&config));
    if tasks.is_empty() {
        if let Some(e) = config_error {
            return Err(Error::InvalidTaskList(format!(
                "no tasks given and the configuration could not be loaded: {e}"
            )));
        }
        tracing::warn!("no tasks to run, set {TASK_LIST_ENV} or pass task names");
        return Ok(ExitCode::SUCCESS);
    }

    let registry = HandlerRegistry::from_config(&config)?;
    let dispatcher = Arc::new(Dispatcher::from_config(&config.push));
    let orchestrator =
        TaskOrchestrator::from_config(registry, &config.runner)?.alert_sink(dispatcher.clone());

    let push = config.need_push && !cli.no_push;
    let config = Arc::new(config);
    let batch = tokio::select! {
        batch = orchestrator.run_all(tasks.into_names(), config.clone()) => batch,
        _ = wait_for_signal() => {
            tracing::warn!("interrupted before the batch finished");
            return Ok(ExitCode::from(INTERRUPTED));
        }
    };

    tracing::info!(
        succeeded = batch.success_count(),
        failed = batch.failure_count(),
        "All tasks finished"
    );

    if push {
        if let Err(e) = send_report(dispatcher.as_ref(), &batch).await {
            tracing::error!(error = %e, "failed to send report");
        }
    } else {
        tracing::debug!("report push disabled");
    }

    Ok(ExitCode::SUCCESS)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn window_flags_build_windowed_mode() {
        let cli = Cli::try_parse_from(["checkin-box", "--window", "2", "--pause-ms", "500", "a", "b"]).unwrap();
        assert_eq!(cli.tasks, ["a", "b"]);
        assert_eq!(
            cli.concurrency_mode(),
            Some(ConcurrencyMode::Windowed {
                width: 2,
                pause: Duration::from_millis(500)
            })
        );
    }

    #[test]
    fn concurrency_flag_builds_sliding_mode() {
        let cli = Cli::try_parse_from(["checkin-box", "--concurrency", "3"]).unwrap();
        assert_eq!(cli.concurrency_mode(), Some(ConcurrencyMode::Sliding { width: 3 }));
        assert!(cli.tasks.is_empty());
    }

    #[test]
    fn log_filter_comes_from_env_file_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "cbList=a\nRUST_LOG=checkin_box=trace\n").unwrap();

        assert_eq!(log_directives(None, Some(&env_file)), "checkin_box=trace");
        assert_eq!(log_directives(Some("warn".into()), Some(&env_file)), "warn");
        assert_eq!(log_directives(None, None), DEFAULT_LOG_DIRECTIVES);
        assert_eq!(
            log_directives(None, Some(&dir.path().join("absent.env"))),
            DEFAULT_LOG_DIRECTIVES
        );
    }

    #[test]
    fn window_and_concurrency_conflict() {
        assert!(Cli::try_parse_from(["checkin-box", "--concurrency", "3", "--window", "2"]).is_err());
        assert!(Cli::try_parse_from(["checkin-box", "--pause-ms", "10"]).is_err());
    }
}
