//! Team chat status messages.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Notice,
    Success,
    Error,
}

impl Severity {
    pub fn prefix(self) -> &'static str {
        match self {
            Severity::Notice => "ℹ️",
            Severity::Success => "👍",
            Severity::Error => "🚨",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Notice => "notice",
            Severity::Success => "success",
            Severity::Error => "error",
        })
    }
}

/// Best-effort sender. Implementations log their own failures and never
/// return them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, message: &str, severity: Severity);
}

pub fn format_message(script_name: &str, message: &str, severity: Severity) -> String {
    format!("{} {}: {}", severity.prefix(), script_name, message)
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct SlackNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
    channel_id: String,
    script_name: String,
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>, channel_id: impl Into<String>, script_name: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_url: DEFAULT_SLACK_API_URL.to_string(),
            token: token.into(),
            channel_id: channel_id.into(),
            script_name: script_name.into(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    async fn send(&self, text: &str) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&json!({ "channel": self.channel_id, "text": text }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("http status {}", status.as_u16()));
        }
        let body: SlackResponse = resp.json().await.map_err(|e| e.to_string())?;
        if body.ok {
            Ok(())
        } else {
            Err(body.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post(&self, message: &str, severity: Severity) {
        let text = format_message(&self.script_name, message, severity);
        if let Err(err) = self.send(&text).await {
            error!(channel = %self.channel_id, error = %err, "slack error");
        }
    }
}
