//! Slack incoming-webhook notifier.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BuildContext, Notification, check_http_url, check_response, request_error};
use crate::error::{Result, SendError};
use crate::route::format_labels;
use crate::template::TemplateSet;
use crate::types::AlertState;

const DEFAULT_TITLE: &str = "[{{ status }}:{{ num_firing }}] {{ receiver }}";

/// Settings of a `slack` integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Incoming webhook URL.
    pub api_url: String,
    /// Channel override.
    #[serde(default)]
    pub channel: Option<String>,
    /// Username override.
    #[serde(default)]
    pub username: Option<String>,
    /// Title template.
    #[serde(default)]
    pub title: Option<String>,
    /// Body template; a per-alert summary is used when unset.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    title: String,
    text: String,
    fallback: String,
    color: &'static str,
}

/// Posts notifications to Slack.
#[derive(Debug, Clone)]
pub struct SlackSender {
    config: SlackConfig,
    client: reqwest::Client,
    templates: Arc<TemplateSet>,
    timeout: Duration,
}

impl SlackSender {
    /// Creates a Slack sender, checking its templates.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` for a malformed URL and
    /// `AlertError::Template` for a bad title or text template.
    pub fn new(config: SlackConfig, ctx: &BuildContext) -> Result<Self> {
        check_http_url("slack api_url", &config.api_url)?;
        if let Some(title) = &config.title {
            ctx.templates.check("slack.title", title)?;
        }
        if let Some(text) = &config.text {
            ctx.templates.check("slack.text", text)?;
        }
        Ok(Self {
            config,
            client: ctx.http.clone(),
            templates: Arc::clone(&ctx.templates),
            timeout: ctx.timeout,
        })
    }

    fn render(&self, notification: &Notification) -> std::result::Result<SlackAttachment, SendError> {
        let data = &notification.data;
        let title = self
            .templates
            .render_text(self.config.title.as_deref().unwrap_or(DEFAULT_TITLE), data)
            .map_err(|e| SendError::permanent(e.to_string()))?;

        let text = match &self.config.text {
            Some(text) => self
                .templates
                .render_text(text, data)
                .map_err(|e| SendError::permanent(e.to_string()))?,
            None => {
                let mut text = String::new();
                for alert in &notification.alerts {
                    let summary = alert.annotations.get("summary").map_or("", String::as_str);
                    let _ = writeln!(
                        text,
                        "*{}* {} {summary}",
                        alert.state_at(notification.now),
                        format_labels(&alert.labels)
                    );
                }
                text
            }
        };

        Ok(SlackAttachment {
            fallback: title.clone(),
            title,
            text,
            color: match data.status {
                AlertState::Firing => "danger",
                AlertState::Resolved => "good",
            },
        })
    }

    /// Posts a notification.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`]; template failures are permanent.
    pub async fn send(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        let attachment = self.render(notification)?;
        let message = SlackMessage {
            channel: self.config.channel.as_deref(),
            username: self.config.username.as_deref(),
            attachments: vec![attachment],
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .timeout(self.timeout)
            .json(&message)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        check_response(response).await?;

        debug!(alerts = notification.alerts.len(), "sent slack notification");
        Ok(())
    }
}
