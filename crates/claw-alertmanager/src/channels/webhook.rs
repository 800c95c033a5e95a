//! Generic JSON webhook notifier.
//!
//! Posts an Alertmanager-compatible (version 4) payload to a configured URL.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BuildContext, Notification, check_http_url, check_response, request_error};
use crate::error::{Result, SendError};
use crate::types::{Alert, AlertState, LabelSet};

/// Settings of a `webhook` integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// The URL to post notifications to.
    pub url: String,
    /// Extra HTTP headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Maximum alerts per payload; 0 means unlimited.
    #[serde(default)]
    pub max_alerts: usize,
}

/// Posts notifications as JSON.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookSender {
    /// Creates a webhook sender.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` if the URL is not an absolute
    /// http(s) URL.
    pub fn new(config: WebhookConfig, ctx: &BuildContext) -> Result<Self> {
        check_http_url("webhook url", &config.url)?;
        Ok(Self {
            config,
            client: ctx.http.clone(),
            timeout: ctx.timeout,
        })
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Builds the payload for a notification.
    #[must_use]
    pub fn payload(&self, notification: &Notification) -> WebhookPayload {
        WebhookPayload::from_notification(notification, self.config.max_alerts)
    }

    /// Posts a notification.
    ///
    /// # Errors
    ///
    /// Returns a retryable [`SendError`] for transport failures, 5xx and 429,
    /// and a permanent one for other non-2xx responses.
    pub async fn send(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        let payload = self.payload(notification);

        let mut request = self
            .client
            .post(&self.config.url)
            .timeout(self.timeout)
            .json(&payload);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| request_error(&e))?;
        check_response(response).await?;

        debug!(
            url = %self.config.url,
            alerts = payload.alerts.len(),
            status = %payload.status,
            "sent webhook notification"
        );
        Ok(())
    }
}

/// Alertmanager-compatible webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Payload format version.
    pub version: String,
    /// Aggregation group key.
    pub group_key: String,
    /// Alerts dropped because of `max_alerts`.
    pub truncated_alerts: usize,
    /// `firing` if any alert fires.
    pub status: AlertState,
    /// Receiver name.
    pub receiver: String,
    /// The group's label values.
    pub group_labels: LabelSet,
    /// Labels shared by every alert.
    pub common_labels: LabelSet,
    /// Annotations shared by every alert.
    pub common_annotations: BTreeMap<String, String>,
    /// The alerts.
    pub alerts: Vec<WebhookAlert>,
}

impl WebhookPayload {
    /// Builds the payload, keeping at most `max_alerts` alerts (0 = all).
    #[must_use]
    pub fn from_notification(notification: &Notification, max_alerts: usize) -> Self {
        let data = &notification.data;
        let keep = if max_alerts == 0 {
            notification.alerts.len()
        } else {
            max_alerts.min(notification.alerts.len())
        };

        Self {
            version: "4".to_string(),
            group_key: data.group_key.clone(),
            truncated_alerts: notification.alerts.len() - keep,
            status: data.status,
            receiver: data.receiver.clone(),
            group_labels: data.group_labels.clone(),
            common_labels: data.common_labels.clone(),
            common_annotations: data.common_annotations.clone(),
            alerts: notification.alerts[..keep]
                .iter()
                .map(|a| WebhookAlert::from_alert(a, notification.now))
                .collect(),
        }
    }
}

/// One alert in a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    /// `firing` or `resolved`.
    pub status: AlertState,
    /// Identifying labels.
    pub labels: LabelSet,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// RFC 3339 start time.
    pub starts_at: String,
    /// RFC 3339 end time.
    pub ends_at: String,
    /// Link back to the source.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Label fingerprint.
    pub fingerprint: String,
}

impl WebhookAlert {
    /// Converts an alert, evaluating its status at `now`.
    #[must_use]
    pub fn from_alert(alert: &Alert, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            status: alert.state_at(now),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at.to_rfc3339(),
            ends_at: alert.ends_at.to_rfc3339(),
            generator_url: alert.generator_url.clone().unwrap_or_default(),
            fingerprint: alert.fingerprint().to_string(),
        }
    }
}
