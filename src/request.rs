//! Resilient HTTP request primitive shared by every job handler
//!
//! [`RequestClient::execute`] never returns an error: every transport failure,
//! rejected status and embedded application error is folded into a
//! [`RequestOutcome`]. Transient failures (timeouts, unreachable hosts and the
//! policy's retryable statuses) are retried per the [`RetryPolicy`].

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::fmt;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::retry::{IsRetryable, with_retry};
use crate::types::RequestOutcome;

/// Request body
#[derive(Clone, Debug)]
pub enum Body {
    /// Serialized as JSON with a matching content type
    Json(serde_json::Value),
    /// URL-encoded form fields
    Form(Vec<(String, String)>),
    /// Sent as-is
    Text(String),
}

/// An application-level error code embedded in an otherwise successful response
///
/// Some APIs answer `200 OK` with a JSON body such as `{"code": 3001}` when the
/// credential was rejected. Matching responses are treated as terminal failures.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorSentinel {
    /// Top-level JSON field holding the code
    pub field: String,
    /// Code value signalling the error
    pub code: serde_json::Value,
    /// Diagnostic reported when the sentinel matches
    pub message: String,
}

impl ErrorSentinel {
    /// Sentinel matching `{"<field>": <code>}`
    pub fn new(
        field: impl Into<String>,
        code: impl Into<serde_json::Value>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    fn matches(&self, data: &serde_json::Value) -> bool {
        data.get(&self.field).is_some_and(|v| *v == self.code)
    }
}

impl Default for ErrorSentinel {
    fn default() -> Self {
        Self::new("code", 3001, "authentication rejected")
    }
}

/// Why a single attempt did not succeed
#[derive(Debug)]
enum AttemptError {
    /// No response within the timeout
    Timeout(Duration),
    /// No response at all (DNS, refused connection, reset)
    Unreachable(String),
    /// A response whose status is in the retryable set
    RetryableStatus(u16),
    /// 2xx carrying an application error code
    Sentinel { status: u16, message: String },
    /// 4xx outside the retryable set
    ClientError(u16),
    /// Anything else
    UnhandledStatus(u16),
}

impl AttemptError {
    fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Timeout(_) | AttemptError::Unreachable(_) => None,
            AttemptError::RetryableStatus(s)
            | AttemptError::ClientError(s)
            | AttemptError::UnhandledStatus(s)
            | AttemptError::Sentinel { status: s, .. } => Some(*s),
        }
    }
}

impl IsRetryable for AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptError::Timeout(_) | AttemptError::Unreachable(_) | AttemptError::RetryableStatus(_)
        )
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout(t) => write!(f, "request timed out after {}ms", t.as_millis()),
            AttemptError::Unreachable(e) => write!(f, "no response from server: {e}"),
            AttemptError::RetryableStatus(s) => write!(f, "server error (status {s})"),
            AttemptError::Sentinel { message, .. } => write!(f, "{message}"),
            AttemptError::ClientError(s) => match *s {
                400 => write!(f, "malformed request (status 400)"),
                401 => write!(f, "unauthorized (status 401), check the configured credential"),
                403 => write!(f, "forbidden (status 403)"),
                404 => write!(f, "resource not found (status 404)"),
                other => write!(f, "request rejected (status {other})"),
            },
            AttemptError::UnhandledStatus(s) => write!(f, "unhandled status {s}"),
        }
    }
}

/// HTTP client with retry, classification and outcome normalization
///
/// Cloning is cheap; clones share the connection pool and default headers.
#[derive(Clone, Debug)]
pub struct RequestClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    sentinels: Vec<ErrorSentinel>,
}

impl Default for RequestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestClient {
    /// Client with default headers, policy and sentinels
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Wrap a preconfigured reqwest client (cookies, default headers, proxies)
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            policy: RetryPolicy::default(),
            sentinels: vec![ErrorSentinel::default()],
        }
    }

    /// Client sending `headers` with every request
    ///
    /// Job handlers use this to hold their own session credential.
    pub fn with_headers<I, K, V>(headers: I) -> crate::error::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_ref().as_bytes()).map_err(|e| {
                crate::error::Error::Other(format!("invalid header name {}: {e}", name.as_ref()))
            })?;
            let value = HeaderValue::from_str(value.as_ref())
                .map_err(|e| crate::error::Error::Other(format!("invalid header value: {e}")))?;
            map.insert(name, value);
        }
        let http = reqwest::Client::builder().default_headers(map).build()?;
        Ok(Self::with_client(http))
    }

    /// Replace the default policy
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the embedded error sentinels
    pub fn sentinels(mut self, sentinels: Vec<ErrorSentinel>) -> Self {
        self.sentinels = sentinels;
        self
    }

    /// Default policy applied when a call does not bring its own
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET `url` with the default policy
    pub async fn get(&self, url: &str) -> RequestOutcome {
        self.execute(Method::GET, url, None, None).await
    }

    /// POST a JSON body to `url` with the default policy
    pub async fn post_json(&self, url: &str, body: serde_json::Value) -> RequestOutcome {
        self.execute(Method::POST, url, Some(Body::Json(body)), None).await
    }

    /// Issue one logical call, retrying transient failures
    ///
    /// `policy` overrides the client default for this call only.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<Body>,
        policy: Option<&RetryPolicy>,
    ) -> RequestOutcome {
        let policy = policy.unwrap_or(&self.policy);

        let outcome = with_retry(policy, || self.attempt(&method, url, body.as_ref(), policy)).await;

        match outcome.result {
            Ok((status, data)) => {
                tracing::info!(%method, url, status, retries = outcome.retries, "request succeeded");
                RequestOutcome::success(status, data, outcome.retries)
            }
            Err(e) if e.is_retryable() => {
                let message = format!(
                    "request failed after {} retries: {method} {url}: {e}",
                    outcome.retries
                );
                tracing::error!(%method, url, status = ?e.status(), retries = outcome.retries, "retries exhausted");
                RequestOutcome::failure(e.status(), message, outcome.retries)
            }
            Err(e) => {
                tracing::error!(%method, url, status = ?e.status(), error = %e, "request failed");
                RequestOutcome::failure(e.status(), e.to_string(), outcome.retries)
            }
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Body>,
        policy: &RetryPolicy,
    ) -> Result<(u16, Option<serde_json::Value>), AttemptError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(policy.timeout);
        request = match body {
            Some(Body::Json(value)) => request.json(value),
            Some(Body::Form(fields)) => request.form(fields),
            Some(Body::Text(text)) => request.body(text.clone()),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Timeout(policy.timeout)
            } else {
                AttemptError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        let code = status.as_u16();

        if status.is_success() {
            let text = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout(policy.timeout)
                } else {
                    AttemptError::Unreachable(e.to_string())
                }
            })?;
            let data = parse_payload(text);
            if let Some(sentinel) = data
                .as_ref()
                .and_then(|d| self.sentinels.iter().find(|s| s.matches(d)))
            {
                tracing::warn!(%method, url, status = code, field = %sentinel.field, "response carries an embedded error code");
                return Err(AttemptError::Sentinel {
                    status: code,
                    message: format!("{} ({} {})", sentinel.message, sentinel.field, sentinel.code),
                });
            }
            return Ok((code, data));
        }

        Err(classify_status(status, policy))
    }
}

fn classify_status(status: StatusCode, policy: &RetryPolicy) -> AttemptError {
    let code = status.as_u16();
    if policy.is_retryable_status(code) {
        AttemptError::RetryableStatus(code)
    } else if status.is_client_error() {
        AttemptError::ClientError(code)
    } else {
        AttemptError::UnhandledStatus(code)
    }
}

/// JSON when the body parses as JSON, a string otherwise, nothing when empty
fn parse_payload(text: String) -> Option<serde_json::Value> {
    if text.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
}
