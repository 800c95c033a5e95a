//! A notifier that writes notifications to the tracing log.
//!
//! Useful as a default receiver and for debugging routing trees.

use tracing::{info, warn};

use super::Notification;
use crate::types::AlertState;

/// Logs each alert of a notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

impl LogSender {
    /// Logs the notification. Never fails.
    pub fn send(&self, notification: &Notification) {
        let data = &notification.data;
        for alert in &notification.alerts {
            match alert.state_at(notification.now) {
                AlertState::Firing => {
                    warn!(
                        receiver = %data.receiver,
                        group_key = %data.group_key,
                        alertname = %alert.name(),
                        fingerprint = %alert.fingerprint(),
                        labels = ?alert.labels,
                        "ALERT"
                    );
                }
                AlertState::Resolved => {
                    info!(
                        receiver = %data.receiver,
                        group_key = %data.group_key,
                        alertname = %alert.name(),
                        fingerprint = %alert.fingerprint(),
                        "RESOLVED"
                    );
                }
            }
        }
    }
}
