//! Configuration types for checkin-box
//!
//! The configuration file is YAML. Besides the typed sections below, every other
//! top-level key is kept as an opaque per-job section that handlers look up by
//! their own task name.
//!
//! ```yaml
//! cbList: wps&exampleTask
//! needPush: true
//! Push:
//!   sckey: SCT0000
//! runner:
//!   concurrency:
//!     mode: windowed
//!     width: 5
//!     pause: 1000
//! exampleTask:
//!   token: abc,def
//! ```

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::retry::with_retry;

/// Environment variable holding the task list
pub const TASK_LIST_ENV: &str = "cbList";
/// Environment variable holding a remote configuration URL
pub const REMOTE_CONFIG_ENV: &str = "ycurl";
/// Environment variable pointing at a Qinglong panel data root
pub const QL_DIR_ENV: &str = "QL_DIR";
/// Environment variable holding a JSON push configuration override
pub const PUSH_CONFIG_ENV: &str = "PUSH_CONFIG";

/// Default distress pattern for fast alerts
pub const DEFAULT_DISTRESS_PATTERN: &str = r"(?i)cookie|expired|invalid|failed|失效|失败";

/// Default width of a concurrency window
pub const DEFAULT_WINDOW_WIDTH: usize = 5;

#[allow(clippy::expect_used)]
static TASK_LIST_DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[&,]").expect("task list delimiter pattern is valid"));

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tasks to run when none are given on the command line or in the environment
    #[serde(rename = "cbList", default)]
    pub cb_list: TaskList,

    /// Whether to send the end-of-batch report
    #[serde(rename = "needPush", default)]
    pub need_push: bool,

    /// Notification channels
    #[serde(rename = "Push", alias = "push", default)]
    pub push: PushConfig,

    /// Default request policy for job handlers
    #[serde(default)]
    pub request: RetryPolicy,

    /// Orchestrator settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Config-driven HTTP check-in jobs, keyed by task name
    #[serde(default)]
    pub jobs: HashMap<String, HttpJobConfig>,

    /// Every other top-level key, exposed to handlers by task name
    #[serde(flatten)]
    pub sections: HashMap<String, serde_json::Value>,
}

impl Config {
    /// Parse a YAML document and validate it
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-job section for `task_name`
    pub fn section(&self, task_name: &str) -> Option<&serde_json::Value> {
        self.sections.get(task_name)
    }

    /// Replace the push section with a JSON document (the `PUSH_CONFIG` format)
    ///
    /// The document may either be the push section itself or wrap it in a `Push` key.
    pub fn apply_push_override(&mut self, json: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let section = value
            .get("Push")
            .or_else(|| value.get("push"))
            .cloned()
            .unwrap_or(value);
        self.push = serde_json::from_value(section)?;
        Ok(())
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.runner.validate()?;
        for (name, job) in &self.jobs {
            job.validate(name)?;
        }
        for webhook in &self.push.webhooks {
            Url::parse(&webhook.url).map_err(|e| {
                Error::config(format!("invalid webhook URL {}: {e}", webhook.url), "Push.webhooks")
            })?;
        }
        Ok(())
    }
}

/// Ordered list of task names
///
/// Deserializes from either a sequence or a single string delimited by `,` or `&`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TaskList(pub Vec<String>);

impl TaskList {
    /// Split a delimited string into task names, dropping blanks
    pub fn parse(raw: &str) -> Self {
        Self(
            TASK_LIST_DELIMITER
                .split(raw)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Task names in order
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Consume into the underlying names
    pub fn into_names(self) -> Vec<String> {
        self.0
    }

    /// True when no task is listed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'de> Deserialize<'de> for TaskList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Delimited(String),
            List(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Delimited(s) => TaskList::parse(&s),
            Raw::List(items) => TaskList(
                items
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        })
    }
}

/// Pick the task list: command line first, then the environment, then the config file
pub fn resolve_task_list(cli: &[String], env: Option<&str>, config: Option<&Config>) -> TaskList {
    if !cli.is_empty() {
        let list = TaskList::parse(&cli.join(","));
        tracing::info!(source = "command line", tasks = ?list.names(), "task list resolved");
        return list;
    }
    if let Some(raw) = env.filter(|s| !s.trim().is_empty()) {
        let list = TaskList::parse(raw);
        tracing::info!(source = "environment", tasks = ?list.names(), "task list resolved");
        return list;
    }
    if let Some(config) = config.filter(|c| !c.cb_list.is_empty()) {
        tracing::info!(source = "config file", tasks = ?config.cb_list.names(), "task list resolved");
        return config.cb_list.clone();
    }
    TaskList::default()
}

/// Retry and timeout policy for one logical request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries on top of the initial attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before each retry, in milliseconds (default: 2000)
    #[serde(default = "default_retry_delay", with = "duration_ms_serde")]
    pub retry_delay: Duration,

    /// Per-attempt timeout, in milliseconds (default: 5000)
    #[serde(default = "default_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,

    /// Statuses worth another attempt (default: 408, 500, 502, 503, 504)
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: BTreeSet<u16>,

    /// How the delay evolves between retries (default: fixed)
    #[serde(default)]
    pub backoff: Backoff,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
            retryable_status_codes: default_retryable_status_codes(),
            backoff: Backoff::default(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Whether `status` is in the retryable set
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Delay before retry number `retry` (1-based), before jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.retry_delay.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    *max_delay
                }
            }
        }
    }
}

/// Delay progression between retries
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay multiplied after every retry, capped at `max_delay`
    Exponential {
        /// Growth factor per retry
        multiplier: f64,
        /// Upper bound for a single delay, in milliseconds
        #[serde(with = "duration_ms_serde")]
        max_delay: Duration,
    },
}

/// How many jobs may run at the same time
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Start every job at once and wait for all of them to settle
    #[default]
    Unbounded,
    /// Run jobs in consecutive windows of `width`, pausing between windows
    Windowed {
        /// Jobs per window
        #[serde(default = "default_window_width")]
        width: usize,
        /// Pause between the end of one window and the start of the next, in milliseconds
        #[serde(default, with = "duration_ms_serde")]
        pause: Duration,
    },
    /// Keep at most `width` jobs active, starting the next one as soon as one settles
    Sliding {
        /// Maximum number of active jobs
        width: usize,
    },
}

fn default_window_width() -> usize {
    DEFAULT_WINDOW_WIDTH
}

impl ConcurrencyMode {
    /// Maximum number of concurrently active jobs, if bounded
    pub fn width(&self) -> Option<usize> {
        match self {
            ConcurrencyMode::Unbounded => None,
            ConcurrencyMode::Windowed { width, .. } | ConcurrencyMode::Sliding { width } => {
                Some(*width)
            }
        }
    }
}

/// Orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Scheduling mode (default: unbounded)
    #[serde(default)]
    pub concurrency: ConcurrencyMode,

    /// Optional cap on a single job's run time, in milliseconds (default: none)
    #[serde(default, with = "optional_duration_ms_serde")]
    pub job_timeout: Option<Duration>,

    /// Regex matched against successful job messages to raise a fast alert
    #[serde(default = "default_distress_pattern")]
    pub distress_pattern: String,

    /// Also raise a fast alert for failed jobs (default: true)
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyMode::default(),
            job_timeout: None,
            distress_pattern: default_distress_pattern(),
            alert_on_failure: true,
        }
    }
}

impl RunnerConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrency.width() == Some(0) {
            return Err(Error::config(
                "concurrency width must be at least 1",
                "runner.concurrency.width",
            ));
        }
        Regex::new(&self.distress_pattern).map_err(|e| {
            Error::config(
                format!("invalid distress pattern: {e}"),
                "runner.distress_pattern",
            )
        })?;
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(Error::config(
                "job timeout must be greater than zero",
                "runner.job_timeout",
            ));
        }
        Ok(())
    }
}

/// Notification channel configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushConfig {
    /// Master switch for all channels (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// ServerChan send key
    #[serde(rename = "sckey", default)]
    pub server_chan_key: Option<String>,

    /// Telegram bot settings
    #[serde(rename = "tgpushkey", default)]
    pub telegram: Option<TelegramConfig>,

    /// PushPlus token
    #[serde(rename = "pushplustoken", default)]
    pub pushplus_token: Option<String>,

    /// Qmsg key
    #[serde(rename = "qmsgkey", default)]
    pub qmsg_key: Option<String>,

    /// WeCom (WeChat Work) application settings
    #[serde(rename = "qywx", default)]
    pub wecom: Option<WeComConfig>,

    /// VoceChat bot settings
    #[serde(default)]
    pub vocechat: Option<VoceChatConfig>,

    /// Generic JSON webhooks
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_chan_key: None,
            telegram: None,
            pushplus_token: None,
            qmsg_key: None,
            wecom: None,
            vocechat: None,
            webhooks: Vec::new(),
        }
    }
}

/// Telegram bot credentials
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token
    #[serde(rename = "tgbotoken")]
    pub bot_token: String,
    /// Target chat id
    #[serde(rename = "chatid", deserialize_with = "string_or_number")]
    pub chat_id: String,
}

/// WeCom application message settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeComConfig {
    /// Corporation id
    #[serde(default)]
    pub corpid: String,
    /// Application secret; the channel is off while this is empty
    #[serde(default)]
    pub corpsecret: String,
    /// Application agent id (default: 1000002)
    #[serde(default = "default_wecom_agent_id")]
    pub agentid: u64,
    /// Cover image; when set the report is sent as an mpnews article
    #[serde(default)]
    pub mediaid: Option<String>,
}

impl Default for WeComConfig {
    fn default() -> Self {
        Self {
            corpid: String::new(),
            corpsecret: String::new(),
            agentid: default_wecom_agent_id(),
            mediaid: None,
        }
    }
}

/// VoceChat bot settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VoceChatConfig {
    /// Server root, e.g. `https://chat.example.com`
    #[serde(default)]
    pub api: String,
    /// Recipient user id
    #[serde(default, deserialize_with = "string_or_number")]
    pub uid: String,
    /// Bot API key
    #[serde(default)]
    pub key: String,
}

/// Webhook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to POST to
    pub url: String,

    /// Optional authentication header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for webhook requests, in milliseconds (default: 30 seconds)
    #[serde(default = "default_webhook_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,
}

/// A check-in job fully described by configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpJobConfig {
    /// Endpoint to call
    pub url: String,

    /// HTTP method (default: POST)
    #[serde(default = "default_job_method")]
    pub method: String,

    /// Header carrying the credential (default: Cookie)
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// One credential per account, as a list or a comma separated string
    #[serde(default)]
    pub credentials: TaskList,

    /// Optional JSON body
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    /// Substring the response body must contain for the check-in to count
    #[serde(default)]
    pub success_marker: Option<String>,

    /// Request policy override for this job
    #[serde(default)]
    pub request: Option<RetryPolicy>,
}

impl HttpJobConfig {
    fn validate(&self, name: &str) -> Result<()> {
        let key = format!("jobs.{name}");
        Url::parse(&self.url)
            .map_err(|e| Error::config(format!("invalid URL {}: {e}", self.url), key.clone()))?;
        reqwest::Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::config(format!("invalid HTTP method {}", self.method), key.clone()))?;
        reqwest::header::HeaderName::from_bytes(self.credential_header.as_bytes()).map_err(|_| {
            Error::config(
                format!("invalid header name {}", self.credential_header),
                key,
            )
        })?;
        Ok(())
    }
}

/// Where to read the configuration from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// A YAML document served over HTTP
    Remote(Url),
    /// A local YAML file
    File(PathBuf),
}

impl ConfigSource {
    /// Resolve from the process environment
    pub fn from_env() -> Result<Self> {
        Self::resolve(
            std::env::var(REMOTE_CONFIG_ENV).ok(),
            std::env::var_os(QL_DIR_ENV).map(PathBuf::from),
        )
    }

    /// Remote URL wins; otherwise the Qinglong data dir; otherwise `./config.yml`
    pub fn resolve(remote: Option<String>, ql_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(raw) = remote.filter(|s| !s.trim().is_empty()) {
            let url = Url::parse(raw.trim()).map_err(|e| {
                Error::config(format!("invalid remote config URL: {e}"), REMOTE_CONFIG_ENV)
            })?;
            return Ok(ConfigSource::Remote(url));
        }
        Ok(match ql_dir {
            Some(dir) => ConfigSource::File(dir.join("data").join("config").join("config.yml")),
            None => ConfigSource::File(PathBuf::from("config.yml")),
        })
    }
}

/// Load, parse and validate the configuration
///
/// Remote documents are fetched under the default [`RetryPolicy`].
pub async fn load_config(source: &ConfigSource) -> Result<Config> {
    load_config_with(source, &RetryPolicy::default()).await
}

/// Load the configuration, fetching remote documents under `policy`
pub async fn load_config_with(source: &ConfigSource, policy: &RetryPolicy) -> Result<Config> {
    match source {
        ConfigSource::Remote(url) => load_remote(url, policy).await,
        ConfigSource::File(path) => load_file(path).await,
    }
}

async fn load_remote(url: &Url, policy: &RetryPolicy) -> Result<Config> {
    let http = reqwest::Client::builder().timeout(policy.timeout).build()?;
    let body = with_retry(policy, || fetch_text(&http, url))
        .await
        .result?;
    if !body.contains("cbList") {
        return Err(Error::config(
            "remote configuration has no cbList entry",
            REMOTE_CONFIG_ENV,
        ));
    }
    tracing::info!(%url, "loaded remote configuration");
    Config::from_yaml_str(&body)
}

async fn fetch_text(http: &reqwest::Client, url: &Url) -> Result<String> {
    Ok(http
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

async fn load_file(path: &Path) -> Result<Config> {
    let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Config {
                message: format!(
                    "configuration file {} not found, set {REMOTE_CONFIG_ENV} for a remote one",
                    path.display()
                ),
                key: None,
            }
        } else {
            Error::Io(e)
        }
    })?;
    tracing::info!(path = %path.display(), "loaded configuration file");
    Config::from_yaml_str(&yaml)
}

/// Ids are written both quoted and bare in existing configuration files
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

fn default_wecom_agent_id() -> u64 {
    1_000_002
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408, 500, 502, 503, 504].into_iter().collect()
}

fn default_distress_pattern() -> String {
    DEFAULT_DISTRESS_PATTERN.to_string()
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_job_method() -> String {
    "POST".to_string()
}

fn default_credential_header() -> String {
    "Cookie".to_string()
}

fn default_true() -> bool {
    true
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
