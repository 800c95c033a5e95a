//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use claw_alertmanager::{
    ConfigDocument, EngineSettings, Fingerprint, IntegrationRegistry, Notification, NotificationEngine,
    Notifier, SendError, Sender,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// One notification as seen by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub receiver: String,
    pub firing: usize,
    pub resolved: usize,
    pub alerts: Vec<Fingerprint>,
}

/// A sender that records notifications and can be told to fail.
#[derive(Debug, Default)]
pub struct Recorder {
    sent: Mutex<Vec<Sent>>,
    calls: AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
}

impl Recorder {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Sender for Recorder {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SendError::retryable("receiver unavailable"));
            }
            self.sent.lock().push(Sent {
                receiver: notification.data.receiver.clone(),
                firing: notification.data.num_firing,
                resolved: notification.data.num_resolved,
                alerts: notification.alerts.iter().map(|a| a.fingerprint()).collect(),
            });
            Ok(())
        })
    }
}

/// Settings with short timeouts suitable for tests.
pub fn settings(dir: &Path) -> EngineSettings {
    let mut settings = EngineSettings::with_data_dir(dir);
    settings.alerts.resolve_timeout_secs = 1;
    settings.alerts.retention_secs = 1;
    settings.notify.send_timeout_secs = 1;
    settings.notify.min_retry_timeout_secs = 1;
    settings.notify.initial_backoff_ms = 10;
    settings.notify.max_backoff_ms = 20;
    settings.notify.max_attempts = 3;
    settings.dispatch.maintenance_interval_ms = 50;
    settings.reload.poll_interval_secs = 0;
    settings
}

/// Builds an engine whose `recorder` integration type writes to `recorder`.
pub fn engine(dir: &Path, recorder: &Arc<Recorder>) -> NotificationEngine {
    let mut registry = IntegrationRegistry::default();
    let recorder = Arc::clone(recorder);
    registry.register("recorder", true, move |_, _| Ok(Notifier::Custom(recorder.clone())));
    NotificationEngine::with_registry(settings(dir), registry).expect("engine")
}

/// A document routing everything to one recorder receiver.
pub fn document(group_interval: &str, repeat_interval: &str) -> ConfigDocument {
    ConfigDocument::from_json(&format!(
        r#"{{
            "route": {{
                "receiver": "team",
                "group_by": ["alertname"],
                "group_wait": "0s",
                "group_interval": "{group_interval}",
                "repeat_interval": "{repeat_interval}"
            }},
            "receivers": [
                {{"name": "team", "integrations": [{{"type": "recorder"}}]}}
            ]
        }}"#
    ))
    .expect("document")
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
