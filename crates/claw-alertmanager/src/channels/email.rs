//! SMTP email notifier.

use std::fmt::Write as _;
use std::sync::Arc;

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BuildContext, Notification};
use crate::error::{AlertError, Result, SendError};
use crate::route::format_labels;
use crate::template::TemplateSet;

const DEFAULT_SUBJECT: &str = "[{{ status }}:{{ num_firing }}] {{ receiver }} {{ group_key }}";

const fn default_require_tls() -> bool {
    true
}

/// Settings of an `email` integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Sender address.
    pub from: String,
    /// SMTP relay host.
    pub smarthost: String,
    /// SMTP port; the transport default when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// SMTP username.
    #[serde(default)]
    pub auth_username: Option<String>,
    /// SMTP password.
    #[serde(default)]
    pub auth_password: Option<String>,
    /// Use STARTTLS.
    #[serde(default = "default_require_tls")]
    pub require_tls: bool,
    /// Subject template.
    #[serde(default)]
    pub subject: Option<String>,
    /// Body template; a per-alert listing is used when unset.
    #[serde(default)]
    pub body: Option<String>,
}

/// Sends notifications as plain-text email.
#[derive(Debug, Clone)]
pub struct EmailSender {
    from: Mailbox,
    to: Vec<Mailbox>,
    subject: Option<String>,
    body: Option<String>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    templates: Arc<TemplateSet>,
}

impl EmailSender {
    /// Creates an email sender, parsing addresses and building the transport.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidConfig` for bad addresses or relay, and
    /// `AlertError::Template` for bad subject or body templates.
    pub fn new(config: EmailConfig, ctx: &BuildContext) -> Result<Self> {
        if config.to.is_empty() {
            return Err(AlertError::config("email requires at least one recipient"));
        }
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| AlertError::config(format!("invalid from address '{}': {e}", config.from)))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| AlertError::config(format!("invalid to address '{addr}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(subject) = &config.subject {
            ctx.templates.check("email.subject", subject)?;
        }
        if let Some(body) = &config.body {
            ctx.templates.check("email.body", body)?;
        }

        let mut builder = if config.require_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smarthost).map_err(|e| {
                AlertError::config(format!("invalid smarthost '{}': {e}", config.smarthost))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smarthost)
        };
        if let Some(port) = config.port {
            builder = builder.port(port);
        }
        if let (Some(user), Some(pass)) = (config.auth_username, config.auth_password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        let transport = builder.timeout(Some(ctx.timeout)).build();

        Ok(Self {
            from,
            to,
            subject: config.subject,
            body: config.body,
            transport,
            templates: Arc::clone(&ctx.templates),
        })
    }

    fn render(&self, notification: &Notification) -> std::result::Result<(String, String), SendError> {
        let data = &notification.data;
        let subject = self
            .templates
            .render_text(self.subject.as_deref().unwrap_or(DEFAULT_SUBJECT), data)
            .map_err(|e| SendError::permanent(e.to_string()))?;

        let body = match &self.body {
            Some(body) => self
                .templates
                .render_text(body, data)
                .map_err(|e| SendError::permanent(e.to_string()))?,
            None => {
                let mut body = format!(
                    "{} firing, {} resolved for {}\n\n",
                    data.num_firing, data.num_resolved, data.receiver
                );
                for alert in &notification.alerts {
                    let _ = writeln!(
                        body,
                        "[{}] {} since {}",
                        alert.state_at(notification.now),
                        format_labels(&alert.labels),
                        alert.starts_at.to_rfc3339()
                    );
                    for (name, value) in &alert.annotations {
                        let _ = writeln!(body, "    {name}: {value}");
                    }
                }
                body
            }
        };
        Ok((subject, body))
    }

    /// Sends one message to all recipients.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`]; permanent SMTP replies are not retryable.
    pub async fn send(&self, notification: &Notification) -> std::result::Result<(), SendError> {
        let (subject, body) = self.render(notification)?;

        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        let message = builder
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| SendError::permanent(format!("failed to build email: {e}")))?;

        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                SendError::permanent(format!("smtp rejected message: {e}"))
            } else {
                SendError::retryable(format!("smtp send failed: {e}"))
            }
        })?;

        debug!(recipients = self.to.len(), "sent email notification");
        Ok(())
    }
}
