//! `PagerDuty` Events API v2 notifier.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{BuildContext, Notification, check_http_url, check_response, request_error};
use crate::error::{AlertError, Result, SendError};
use crate::template::TemplateSet;
use crate::types::AlertState;

const DEFAULT_URL: &str = "https://events.pagerduty.com/v2/enqueue";
const DEFAULT_SUMMARY: &str = "[{{ status }}:{{ num_firing }}] {{ group_key }}";
const MAX_SUMMARY_CHARS: usize = 1024;

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_severity() -> String {
    "error".to_string()
}

/// Settings of a `pagerduty` integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagerDutyConfig {
    /// Integration routing key.
    pub routing_key: String,
    /// Events API endpoint.
    #[serde(default = "default_url")]
    pub url: String,
    /// Event severity: critical, error, warning or info.
    #[serde(default = "default_severity")]
    pub severity: String,
    /// Summary template.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Triggers and resolves `PagerDuty` incidents, one per aggregation group.
#[derive(Debug, Clone)]
pub struct PagerDutySender {
    config: PagerDutyConfig,
    client: reqwest::Client,
    templates: Arc<TemplateSet>,
    timeout: Duration,
}

impl PagerDutySender {
    /// Creates a `PagerDuty` sender.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` for a missing routing key or an
    /// unknown severity.
    pub fn new(config: PagerDutyConfig, ctx: &BuildContext) -> Result<Self> {
        check_http_url("pagerduty url", &config.url)?;
        if config.routing_key.is_empty() {
            return Err(AlertError::config("pagerduty routing_key cannot be empty"));
        }
        if !matches!(config.severity.as_str(), "critical" | "error" | "warning" | "info") {
            return Err(AlertError::config(format!(
                "unknown pagerduty severity '{}'",
                config.severity
            )));
        }
        if let Some(summary) = &config.summary {
            ctx.templates.check("pagerduty.summary", summary)?;
        }
        Ok(Self {
            config,
            client: ctx.http.clone(),
            templates: Arc::clone(&ctx.templates),
            timeout: ctx.timeout,
        })
    }

    fn event(&self, notification: &Notification) -> std::result::Result<serde_json::Value, SendError> {
        let data = &notification.data;
        let summary: String = self
            .templates
            .render_text(self.config.summary.as_deref().unwrap_or(DEFAULT_SUMMARY), data)
            .map_err(|e| SendError::permanent(e.to_string()))?
            .chars()
            .take(MAX_SUMMARY_CHARS)
            .collect();

        let action = match data.status {
            AlertState::Firing => "trigger",
            AlertState::Resolved => "resolve",
        };

        Ok(json!({
            "routing_key": self.config.routing_key,
            "event_action": action,
            "dedup_key": blake3::hash(data.group_key.as_bytes()).to_hex().to_string(),
            "payload": {
                "summary": summary,
                "source": "claw-alertmanager",
                "severity": self.config.severity,
                "custom_details": {
                    "firing": data.num_firing,
                    "resolved": data.num_resolved,
                    "group_labels": data.group_labels,
                },
            },
        }))
    }

    /// Sends a trigger or resolve event.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] for transport failures and non-2xx responses.
    pub async fn send(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        let event = self.event(notification)?;
        let response = self
            .client
            .post(&self.config.url)
            .timeout(self.timeout)
            .json(&event)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        check_response(response).await?;

        debug!(action = %event["event_action"], "sent pagerduty event");
        Ok(())
    }
}
