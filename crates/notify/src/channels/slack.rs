//! Slack incoming-webhook channel.
//!
//! Events are rendered as Block Kit messages: a header with the severity
//! emoji, a section with the resource and the reason, and a field grid.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::NotifyChannel;
use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// Environment variable holding the webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Webhook calls that take longer are abandoned.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlackChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Channel for the webhook in `SLACK_WEBHOOK_URL`, if one is set.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        match std::env::var(ENV_SLACK_WEBHOOK_URL) {
            Ok(url) if !url.trim().is_empty() => Some(Self::new(url)),
            _ => {
                debug!("{ENV_SLACK_WEBHOOK_URL} not set, Slack channel off");
                None
            }
        }
    }

    #[must_use]
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn render(event: &NotifyEvent) -> Value {
        let severity = event.severity();
        let header = format!("{} {}", severity.emoji(), event.title());
        let fields: Vec<Value> = Self::facts(event)
            .into_iter()
            .map(|(label, value)| json!({"type": "mrkdwn", "text": format!("*{label}*\n{value}")}))
            .collect();

        json!({
            "text": header,
            "blocks": [
                {"type": "header", "text": {"type": "plain_text", "text": header}},
                {"type": "section", "text": {"type": "mrkdwn", "text": Self::summary(event)}},
                {"type": "section", "fields": fields},
                {"type": "context", "elements": [{
                    "type": "mrkdwn",
                    "text": format!(
                        "{} | {}",
                        severity.as_str(),
                        event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                }]},
            ],
        })
    }

    fn summary(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::RemediationFailed {
                resource_id,
                message,
                ..
            } => format!("Warden gave up on `{resource_id}`.\n>{message}"),
            NotifyEvent::ResourceRemoved {
                resource_id,
                reason,
                ..
            } => format!("`{resource_id}` is no longer managed.\n>{reason}"),
        }
    }

    fn facts(event: &NotifyEvent) -> Vec<(&'static str, String)> {
        match event {
            NotifyEvent::RemediationFailed {
                kind,
                error_kind,
                attempts,
                ..
            } => vec![
                ("Kind", kind.clone()),
                ("Error", error_kind.clone()),
                ("Attempts", attempts.to_string()),
            ],
            NotifyEvent::ResourceRemoved { kind, .. } => vec![("Kind", kind.clone())],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .timeout(SEND_TIMEOUT)
            .json(&Self::render(event))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "slack", %status, body = %body, "Slack rejected webhook call");
        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl std::fmt::Debug for SlackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The webhook URL is a credential.
        f.debug_struct("SlackChannel").finish_non_exhaustive()
    }
}
