//! Report and alert delivery
//!
//! [`Notifier`] is the seam the orchestrator sends fast alerts through and the
//! binary sends the end-of-batch report through. [`Dispatcher`] is the stock
//! implementation: it fans a message out to every configured [`Channel`], logs
//! channels that fail, and only reports an error when every channel failed.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::{PushConfig, VoceChatConfig, WeComConfig, WebhookConfig};
use crate::error::{Error, Result};
use crate::types::BatchResult;

/// Default timeout for channels without their own setting
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can deliver a titled message
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message`; `details` carries the batch for the end-of-run report
    async fn notify(&self, title: &str, message: &str, details: Option<&BatchResult>) -> Result<()>;
}

/// A notification channel
#[derive(Clone, Debug)]
pub enum Channel {
    /// ServerChan (`<base_url>/<key>.send`)
    ServerChan {
        /// API root
        base_url: String,
        /// Send key
        key: String,
    },
    /// Telegram bot API
    Telegram {
        /// API root
        base_url: String,
        /// Bot token
        bot_token: String,
        /// Target chat
        chat_id: String,
    },
    /// PushPlus
    PushPlus {
        /// API root
        base_url: String,
        /// User token
        token: String,
    },
    /// Qmsg (`<base_url>/send/<key>`)
    Qmsg {
        /// API root
        base_url: String,
        /// Qmsg key
        key: String,
    },
    /// WeCom application message, sent to every member
    WeCom {
        /// API root
        base_url: String,
        /// Application settings
        app: WeComConfig,
    },
    /// VoceChat bot message to one user; the server root comes from the config
    VoceChat(VoceChatConfig),
    /// Generic JSON webhook
    Webhook(WebhookConfig),
}

impl Channel {
    /// ServerChan with the public endpoint
    pub fn server_chan(key: impl Into<String>) -> Self {
        Channel::ServerChan {
            base_url: "https://sctapi.ftqq.com".to_string(),
            key: key.into(),
        }
    }

    /// Telegram with the public bot API
    pub fn telegram(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Channel::Telegram {
            base_url: "https://api.telegram.org".to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// PushPlus with the public endpoint
    pub fn pushplus(token: impl Into<String>) -> Self {
        Channel::PushPlus {
            base_url: "http://www.pushplus.plus".to_string(),
            token: token.into(),
        }
    }

    /// Qmsg with the public endpoint
    pub fn qmsg(key: impl Into<String>) -> Self {
        Channel::Qmsg {
            base_url: "https://qmsg.zendee.cn".to_string(),
            key: key.into(),
        }
    }

    /// WeCom with the public API
    pub fn wecom(app: WeComConfig) -> Self {
        Channel::WeCom {
            base_url: "https://qyapi.weixin.qq.com".to_string(),
            app,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Channel::ServerChan { .. } => "serverchan",
            Channel::Telegram { .. } => "telegram",
            Channel::PushPlus { .. } => "pushplus",
            Channel::Qmsg { .. } => "qmsg",
            Channel::WeCom { .. } => "wecom",
            Channel::VoceChat(_) => "vocechat",
            Channel::Webhook(_) => "webhook",
        }
    }

    async fn send(
        &self,
        http: &reqwest::Client,
        title: &str,
        message: &str,
        details: Option<&BatchResult>,
    ) -> Result<()> {
        match self {
            Channel::ServerChan { base_url, key } => {
                let url = format!("{}/{key}.send", base_url.trim_end_matches('/'));
                let desp = message.replace('\n', "\n\n");
                let reply = read_reply(http.post(url).form(&[("title", title), ("desp", desp.as_str())])).await?;
                expect_field(&reply, "code", &serde_json::json!(0), "ServerChan")
            }
            Channel::Telegram {
                base_url,
                bot_token,
                chat_id,
            } => {
                let url = format!("{}/bot{bot_token}/sendMessage", base_url.trim_end_matches('/'));
                let reply = read_reply(http.post(url).json(&serde_json::json!({
                    "chat_id": chat_id,
                    "text": format!("{title}\n\n{message}"),
                })))
                .await?;
                expect_field(&reply, "ok", &serde_json::json!(true), "Telegram")
            }
            Channel::PushPlus { base_url, token } => {
                let url = format!("{}/send", base_url.trim_end_matches('/'));
                let reply = read_reply(http.post(url).json(&serde_json::json!({
                    "token": token,
                    "title": title,
                    "content": message.replace('\n', "<br>"),
                    "template": "html",
                })))
                .await?;
                expect_field(&reply, "code", &serde_json::json!(200), "PushPlus")
            }
            Channel::Qmsg { base_url, key } => {
                let url = format!("{}/send/{key}", base_url.trim_end_matches('/'));
                let text = format!("{title}\n{message}");
                let reply = read_reply(http.post(url).form(&[("msg", text.as_str())])).await?;
                expect_field(&reply, "success", &serde_json::json!(true), "Qmsg")
            }
            Channel::WeCom { base_url, app } => send_wecom(http, base_url, app, title, message).await,
            Channel::VoceChat(bot) => {
                let url = format!("{}/api/bot/send_to_user/{}", bot.api.trim_end_matches('/'), bot.uid);
                let text = format!("{title}\n\n{}", message.replace('\n', "\n\n"));
                http.post(url)
                    .header("x-api-key", &bot.key)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(text)
                    .timeout(CHANNEL_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
            Channel::Webhook(webhook) => {
                let payload = WebhookPayload {
                    title,
                    message,
                    details,
                    timestamp: chrono::Utc::now().timestamp(),
                };
                let mut request = http.post(&webhook.url).json(&payload).timeout(webhook.timeout);
                if let Some(auth) = &webhook.auth_header {
                    request = request.header("Authorization", auth);
                }
                let response = request.send().await?;
                if !response.status().is_success() {
                    let status = response.status();
                    return Err(Error::Notification(format!(
                        "webhook returned status {status}: {}",
                        response.text().await.unwrap_or_default()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Fetch an access token, then post an application message to `@all`
async fn send_wecom(
    http: &reqwest::Client,
    base_url: &str,
    app: &WeComConfig,
    title: &str,
    message: &str,
) -> Result<()> {
    let base_url = base_url.trim_end_matches('/');
    let token = read_reply(
        http.get(format!("{base_url}/cgi-bin/gettoken"))
            .query(&[("corpid", app.corpid.as_str()), ("corpsecret", app.corpsecret.as_str())]),
    )
    .await?;
    let access_token = token
        .get("access_token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::Notification(format!("WeCom refused the access token request: {token}")))?;

    let body = match &app.mediaid {
        Some(media_id) => serde_json::json!({
            "touser": "@all",
            "msgtype": "mpnews",
            "agentid": app.agentid,
            "mpnews": {
                "articles": [{
                    "title": title,
                    "thumb_media_id": media_id,
                    "content": message.replace('\n', "<br>"),
                    "digest": message,
                }],
            },
            "safe": 0,
        }),
        None => serde_json::json!({
            "touser": "@all",
            "msgtype": "text",
            "agentid": app.agentid,
            "text": { "content": format!("{title}\n\n{message}") },
            "safe": 0,
        }),
    };
    let reply = read_reply(
        http.post(format!("{base_url}/cgi-bin/message/send"))
            .query(&[("access_token", access_token)])
            .json(&body),
    )
    .await?;
    expect_field(&reply, "errcode", &serde_json::json!(0), "WeCom")
}

async fn read_reply(request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
    Ok(request
        .timeout(CHANNEL_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?)
}

/// Body POSTed to generic webhooks
#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    details: Option<&'a BatchResult>,
    timestamp: i64,
}

fn expect_field(reply: &serde_json::Value, field: &str, expected: &serde_json::Value, channel: &str) -> Result<()> {
    if reply.get(field) == Some(expected) {
        Ok(())
    } else {
        Err(Error::Notification(format!("{channel} rejected the message: {reply}")))
    }
}

/// Fans messages out to every configured channel
#[derive(Clone, Debug)]
pub struct Dispatcher {
    enabled: bool,
    channels: Vec<Channel>,
    http: reqwest::Client,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: Vec::new(),
            http: reqwest::Client::new(),
        }
    }
}

impl Dispatcher {
    /// Dispatcher with no channels
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher for every channel configured in `push`
    pub fn from_config(push: &PushConfig) -> Self {
        let mut dispatcher = Self {
            enabled: push.enabled,
            ..Self::default()
        };
        if let Some(key) = push.server_chan_key.as_deref().filter(|k| !k.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::server_chan(key));
        }
        if let Some(key) = push.qmsg_key.as_deref().filter(|k| !k.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::qmsg(key));
        }
        if let Some(token) = push.pushplus_token.as_deref().filter(|t| !t.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::pushplus(token));
        }
        if let Some(app) = push.wecom.as_ref().filter(|a| !a.corpsecret.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::wecom(app.clone()));
        }
        if let Some(tg) = push.telegram.as_ref().filter(|t| !t.bot_token.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::telegram(&tg.bot_token, &tg.chat_id));
        }
        if let Some(bot) = push.vocechat.as_ref().filter(|b| !b.api.is_empty()) {
            dispatcher = dispatcher.with_channel(Channel::VoceChat(bot.clone()));
        }
        for webhook in &push.webhooks {
            dispatcher = dispatcher.with_channel(Channel::Webhook(webhook.clone()));
        }
        dispatcher
    }

    /// Add a channel
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Configured channels
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn notify(&self, title: &str, message: &str, details: Option<&BatchResult>) -> Result<()> {
        if !self.enabled {
            tracing::warn!("push is disabled, not sending notification");
            return Ok(());
        }
        if self.channels.is_empty() {
            tracing::debug!("no notification channel configured");
            return Ok(());
        }

        let mut failures = Vec::new();
        for channel in &self.channels {
            match channel.send(&self.http, title, message, details).await {
                Ok(()) => tracing::info!(channel = channel.name(), %title, "notification sent"),
                Err(e) => {
                    tracing::warn!(channel = channel.name(), error = %e, "notification failed");
                    failures.push(format!("{}: {e}", channel.name()));
                }
            }
        }

        if failures.len() == self.channels.len() {
            return Err(Error::Notification(failures.join("; ")));
        }
        Ok(())
    }
}

/// Title and body of the end-of-batch report
pub fn format_report(batch: &BatchResult) -> (String, String) {
    let mut message = format!(
        "All tasks finished, succeeded: {}, failed: {}",
        batch.success_count(),
        batch.failure_count()
    );
    for result in batch.results() {
        let status = if result.success { "ok" } else { "failed" };
        message.push_str(&format!("\n\n[{status}] {}\n{}", result.task_name, result.message.trim_end()));
    }
    ("Check-in box".to_string(), message)
}

/// Format and deliver the end-of-batch report
pub async fn send_report(notifier: &dyn Notifier, batch: &BatchResult) -> Result<()> {
    let (title, message) = format_report(batch);
    notifier.notify(&title, &message, Some(batch)).await
}
