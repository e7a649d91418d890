//! Check-in job described entirely by configuration
//!
//! One request per configured credential. The credential is sent in a header
//! (a cookie or an API key); the response counts as a check-in when the request
//! layer reports success and, if configured, the body contains the success marker.

use async_trait::async_trait;
use reqwest::Method;

use super::traits::JobHandler;
use crate::config::{HttpJobConfig, RetryPolicy, TaskList};
use crate::error::{Error, JobError, Result};
use crate::request::{Body, RequestClient};
use crate::types::{JobOutput, RequestOutcome, TaskDescriptor};

/// A config-driven check-in job
#[derive(Clone, Debug)]
pub struct HttpCheckinJob {
    name: String,
    url: String,
    method: Method,
    credential_header: String,
    credentials: Vec<String>,
    credential_env: String,
    body: Option<serde_json::Value>,
    success_marker: Option<String>,
    policy: RetryPolicy,
}

impl HttpCheckinJob {
    /// Build the job named `name`; `default_policy` applies unless the job overrides it
    pub fn from_config(name: &str, config: &HttpJobConfig, default_policy: &RetryPolicy) -> Result<Self> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::config(format!("invalid HTTP method {}", config.method), format!("jobs.{name}")))?;
        Ok(Self {
            name: name.to_string(),
            url: config.url.clone(),
            method,
            credential_header: config.credential_header.clone(),
            credentials: config.credentials.names().to_vec(),
            credential_env: format!("{name}_TOKEN"),
            body: config.body.clone(),
            success_marker: config.success_marker.clone(),
            policy: config.request.clone().unwrap_or_else(|| default_policy.clone()),
        })
    }

    /// Credentials from `<name>_TOKEN` if set, otherwise from the configuration
    fn credentials(&self) -> Vec<String> {
        match std::env::var(&self.credential_env) {
            Ok(raw) if !raw.trim().is_empty() => TaskList::parse(&raw).into_names(),
            _ => self.credentials.clone(),
        }
    }

    async fn check_in(&self, credential: &str) -> std::result::Result<(), String> {
        let client = RequestClient::with_headers([(self.credential_header.as_str(), credential)])
            .map_err(|e| e.to_string())?
            .policy(self.policy.clone());

        let outcome = client
            .execute(self.method.clone(), &self.url, self.body.clone().map(Body::Json), None)
            .await;

        if !outcome.success {
            return Err(outcome
                .message
                .unwrap_or_else(|| "request failed".to_string()));
        }
        match &self.success_marker {
            Some(marker) if !payload_contains(&outcome, marker) => {
                Err(format!("response does not contain \"{marker}\""))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl JobHandler for HttpCheckinJob {
    async fn run(&self, _task: &TaskDescriptor) -> std::result::Result<JobOutput, JobError> {
        let credentials = self.credentials();
        if credentials.is_empty() {
            return Err(JobError::MissingCredentials(self.name.clone()));
        }

        let mut lines = Vec::with_capacity(credentials.len());
        let mut failures = 0;
        for (i, credential) in credentials.iter().enumerate() {
            let account = format!("account {} ({})", i + 1, mask(credential));
            match self.check_in(credential).await {
                Ok(()) => {
                    tracing::info!(task = %self.name, %account, "check-in succeeded");
                    lines.push(format!("{account}: check-in succeeded"));
                }
                Err(reason) => {
                    tracing::warn!(task = %self.name, %account, %reason, "check-in failed");
                    failures += 1;
                    lines.push(format!("{account}: check-in failed, {reason}"));
                }
            }
        }

        let log = lines.join("\n");
        if failures == credentials.len() {
            Err(JobError::Other(log))
        } else if failures > 0 {
            Ok(JobOutput::urgent(log))
        } else {
            Ok(JobOutput::new(log))
        }
    }
}

fn payload_contains(outcome: &RequestOutcome, marker: &str) -> bool {
    match &outcome.data {
        Some(serde_json::Value::String(text)) => text.contains(marker),
        Some(value) => value.to_string().contains(marker),
        None => false,
    }
}

/// Credentials up to this many characters are hidden completely
const MASK_REVEAL_MIN_LEN: usize = 8;

/// First four characters of a long credential, nothing of a short one
fn mask(credential: &str) -> String {
    if credential.chars().count() <= MASK_REVEAL_MIN_LEN {
        return "****".to_string();
    }
    let prefix: String = credential.chars().take(4).collect();
    format!("{prefix}****")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(name: &str, yaml: &str) -> HttpCheckinJob {
        let config: HttpJobConfig = serde_yaml::from_str(yaml).unwrap();
        let policy = RetryPolicy {
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        HttpCheckinJob::from_config(name, &config, &policy).unwrap()
    }

    fn task(name: &str) -> TaskDescriptor {
        TaskDescriptor::new(name, Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn checks_in_every_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .and(header("x-api-key", "alpha-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"msg": "signed"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .and(header("x-api-key", "beta-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"msg": "signed"})))
            .expect(1)
            .mount(&server)
            .await;

        let job = job(
            "httpcheckin_all_ok",
            &format!(
                "url: {}/checkin\ncredential_header: x-api-key\ncredentials: alpha-token,beta-token\nsuccess_marker: signed\n",
                server.uri()
            ),
        );
        let output = job.run(&task("httpcheckin_all_ok")).await.unwrap();

        assert!(!output.urgent);
        assert!(output.message.contains("account 1 (alph****): check-in succeeded"));
        assert!(output.message.contains("account 2 (beta****): check-in succeeded"));
        assert!(!output.message.contains("alpha-token"));
    }

    #[tokio::test]
    async fn partial_failure_is_urgent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("cookie", "good"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("cookie", "stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let job = job(
            "httpcheckin_partial",
            &format!("url: {}\nmethod: get\ncredentials: [good, stale]\n", server.uri()),
        );
        let output = job.run(&task("httpcheckin_partial")).await.unwrap();

        assert!(output.urgent);
        assert!(output.message.contains("account 2 (****): check-in failed"));
        assert!(!output.message.contains("stale"));
        assert!(output.message.contains("unauthorized"));
    }

    #[tokio::test]
    async fn missing_marker_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("already checked in"))
            .mount(&server)
            .await;

        let job = job(
            "httpcheckin_marker",
            &format!("url: {}\ncredentials: one\nsuccess_marker: reward\n", server.uri()),
        );
        let err = job.run(&task("httpcheckin_marker")).await.unwrap_err();

        assert!(err.to_string().contains("does not contain \"reward\""));
    }

    #[tokio::test]
    async fn no_credentials_is_an_error() {
        let job = job("httpcheckin_no_creds", "url: https://example.com\n");
        let err = job.run(&task("httpcheckin_no_creds")).await.unwrap_err();
        assert!(matches!(err, JobError::MissingCredentials(ref n) if n == "httpcheckin_no_creds"));
    }

    #[test]
    fn job_policy_overrides_default() {
        let job = job(
            "override",
            "url: https://example.com\nrequest:\n  max_retries: 7\n",
        );
        assert_eq!(job.policy.max_retries, 7);
        assert_eq!(job.method, Method::POST);
    }

    #[test]
    fn mask_hides_short_credentials_completely() {
        assert_eq!(mask("ab"), "****");
        assert_eq!(mask("12345678"), "****");
        assert_eq!(mask("123456789"), "1234****");
        assert_eq!(mask("签到令牌abcdef"), "签到令牌****");
    }
}
