//! Integration senders.
//!
//! An [`Integration`] is one configured notifier within a receiver. The set
//! of notifier kinds is the closed [`Notifier`] enum, plus a
//! [`Notifier::Custom`] escape hatch for kinds registered at runtime through
//! the [`IntegrationRegistry`]. Integrations hold no mutable state; what was
//! sent lives in the notification log.

mod email;
mod log;
mod pagerduty;
mod slack;
mod webhook;

pub use email::{EmailConfig, EmailSender};
pub use log::LogSender;
pub use pagerduty::{PagerDutyConfig, PagerDutySender};
pub use slack::{SlackConfig, SlackSender};
pub use webhook::{WebhookAlert, WebhookConfig, WebhookPayload, WebhookSender};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::config::{IntegrationConfig, ReceiverConfig};
use crate::error::{AlertError, Result, SendError};
use crate::template::{TemplateData, TemplateSet};
use crate::types::Alert;

/// A rendered notification for one aggregation group.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Template values for the group.
    pub data: TemplateData,
    /// The alerts to report, after muting and `send_resolved` filtering.
    pub alerts: Vec<Alert>,
    /// The flush time used for firing/resolved evaluation.
    pub now: DateTime<Utc>,
}

impl Notification {
    /// Builds a notification about `alerts`.
    #[must_use]
    pub fn new(
        receiver: &str,
        group_key: &str,
        group_labels: crate::types::LabelSet,
        alerts: Vec<Alert>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            data: TemplateData::new(receiver, group_key, group_labels, &alerts, now),
            alerts,
            now,
        }
    }
}

/// A pluggable notifier for custom integration kinds.
///
/// Implementations must be safe to call again with the same notification
/// and must not outlive the caller's timeout on their own.
pub trait Sender: Send + Sync + fmt::Debug {
    /// Delivers a notification.
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, std::result::Result<(), SendError>>;
}

/// The notifier behind an integration.
#[derive(Debug, Clone)]
pub enum Notifier {
    /// Generic JSON webhook.
    Webhook(WebhookSender),
    /// Slack incoming webhook.
    Slack(SlackSender),
    /// `PagerDuty` Events API v2.
    PagerDuty(PagerDutySender),
    /// SMTP email.
    Email(EmailSender),
    /// Writes notifications to the log.
    Log(LogSender),
    /// A runtime-registered notifier.
    Custom(Arc<dyn Sender>),
}

impl Notifier {
    /// Delivers a notification.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] describing whether a retry may help.
    pub async fn send(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        match self {
            Self::Webhook(s) => s.send(notification).await,
            Self::Slack(s) => s.send(notification).await,
            Self::PagerDuty(s) => s.send(notification).await,
            Self::Email(s) => s.send(notification).await,
            Self::Log(s) => {
                s.send(notification);
                Ok(())
            }
            Self::Custom(s) => s.send(notification).await,
        }
    }
}

/// One notifier within a receiver.
#[derive(Debug, Clone)]
pub struct Integration {
    receiver: String,
    kind: String,
    index: usize,
    send_resolved: bool,
    notifier: Notifier,
}

impl Integration {
    /// Creates an integration.
    #[must_use]
    pub fn new(
        receiver: impl Into<String>,
        kind: impl Into<String>,
        index: usize,
        send_resolved: bool,
        notifier: Notifier,
    ) -> Self {
        Self {
            receiver: receiver.into(),
            kind: kind.into(),
            index,
            send_resolved,
            notifier,
        }
    }

    /// Returns the receiver name.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Returns the integration type string.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the position within the receiver.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns true if resolved alerts are reported.
    #[must_use]
    pub const fn send_resolved(&self) -> bool {
        self.send_resolved
    }

    /// Returns the notifier.
    #[must_use]
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Delivers a notification through this integration.
    ///
    /// # Errors
    ///
    /// Returns the notifier's [`SendError`].
    pub async fn notify(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        self.notifier.send(notification).await
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.receiver, self.kind, self.index)
    }
}

/// Shared resources for building notifiers.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// HTTP client shared by HTTP-based notifiers.
    pub http: reqwest::Client,
    /// Templates from the configuration document.
    pub templates: Arc<TemplateSet>,
    /// Per-attempt send timeout.
    pub timeout: Duration,
}

impl BuildContext {
    /// Creates a context with a fresh HTTP client.
    #[must_use]
    pub fn new(templates: Arc<TemplateSet>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            templates,
            timeout,
        }
    }
}

/// Builds a [`Notifier`] from an integration's settings.
pub type IntegrationBuilder =
    Arc<dyn Fn(&IntegrationConfig, &BuildContext) -> Result<Notifier> + Send + Sync>;

/// Maps integration `type` strings to builders.
#[derive(Clone)]
pub struct IntegrationRegistry {
    builders: HashMap<String, (IntegrationBuilder, bool)>,
}

impl fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("IntegrationRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("webhook", true, |cfg, ctx| {
            WebhookSender::new(cfg.settings()?, ctx).map(Notifier::Webhook)
        });
        registry.register("slack", false, |cfg, ctx| {
            SlackSender::new(cfg.settings()?, ctx).map(Notifier::Slack)
        });
        registry.register("pagerduty", true, |cfg, ctx| {
            PagerDutySender::new(cfg.settings()?, ctx).map(Notifier::PagerDuty)
        });
        registry.register("email", false, |cfg, ctx| {
            EmailSender::new(cfg.settings()?, ctx).map(Notifier::Email)
        });
        registry.register("log", true, |_, _| Ok(Notifier::Log(LogSender)));
        registry
    }
}

impl IntegrationRegistry {
    /// Creates a registry with no kinds.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers (or replaces) a builder for `kind`.
    ///
    /// `send_resolved` is the default used when a config omits the flag.
    pub fn register<F>(&mut self, kind: impl Into<String>, send_resolved: bool, builder: F)
    where
        F: Fn(&IntegrationConfig, &BuildContext) -> Result<Notifier> + Send + Sync + 'static,
    {
        self.builders
            .insert(kind.into(), (Arc::new(builder), send_resolved));
    }

    /// Returns true if `kind` has a builder.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Builds every integration of a receiver.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` for an unknown type or settings
    /// the type's builder rejects.
    pub fn build_receiver(&self, receiver: &ReceiverConfig, ctx: &BuildContext) -> Result<Vec<Integration>> {
        receiver
            .integrations
            .iter()
            .enumerate()
            .map(|(index, cfg)| {
                let (builder, default_send_resolved) =
                    self.builders.get(&cfg.kind).ok_or_else(|| {
                        AlertError::config(format!(
                            "receiver '{}': unknown integration type '{}'",
                            receiver.name, cfg.kind
                        ))
                    })?;
                let notifier = builder(cfg, ctx).map_err(|e| {
                    AlertError::config(format!(
                        "receiver '{}' {}[{index}]: {e}",
                        receiver.name, cfg.kind
                    ))
                })?;
                Ok(Integration::new(
                    receiver.name.clone(),
                    cfg.kind.clone(),
                    index,
                    cfg.send_resolved.unwrap_or(*default_send_resolved),
                    notifier,
                ))
            })
            .collect()
    }
}

impl IntegrationConfig {
    /// Deserializes the type-specific settings.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` if the settings do not fit `T`.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.settings.clone()))
            .map_err(|e| AlertError::config(format!("invalid {} settings: {e}", self.kind)))
    }
}

/// Maps a transport-level HTTP failure to a retryable [`SendError`].
/// Checks that `raw` is an absolute http(s) URL with a host.
pub(crate) fn check_http_url(setting: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(AlertError::config(format!("{setting} cannot be empty")));
    }
    let url = reqwest::Url::parse(raw)
        .map_err(|e| AlertError::config(format!("{setting} '{raw}' is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AlertError::config(format!("{setting} '{raw}' must use http or https")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AlertError::config(format!("{setting} '{raw}' has no host")));
    }
    Ok(())
}

pub(crate) fn request_error(err: &reqwest::Error) -> SendError {
    if err.is_builder() {
        SendError::permanent(format!("invalid request: {err}"))
    } else {
        SendError::retryable(format!("request failed: {err}"))
    }
}

/// Turns a non-2xx response into a [`SendError`].
pub(crate) async fn check_response(response: reqwest::Response) -> std::result::Result<(), SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(256)
        .collect();
    Err(SendError::from_status(status.as_u16(), &body))
}
