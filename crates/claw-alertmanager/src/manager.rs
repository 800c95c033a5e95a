//! The notification engine.
//!
//! This module provides [`NotificationEngine`], the main entry point. It
//! owns the alert store, silences, notification log and mute marker, and
//! runs the background tasks around them:
//! - the dispatcher of the current configuration (via [`ConfigReloader`])
//! - alert, silence and notification log garbage collection
//! - periodic snapshots of silences and the notification log
//! - the configuration poller, when a source and interval are configured
//!
//! All tasks observe one cancellation token and are joined on
//! [`shutdown`](NotificationEngine::shutdown), after which a final snapshot
//! is written.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::channels::IntegrationRegistry;
use crate::config::{ConfigDocument, EngineSettings};
use crate::dispatch::GroupSnapshot;
use crate::error::{AlertError, Result};
use crate::marker::{AlertStatus, Marker};
use crate::nflog::NotificationLog;
use crate::normalize;
use crate::reload::{ConfigReloader, ConfigSource, SharedState};
use crate::silence::{NewSilence, Silence, SilenceFilter, SilenceStore};
use crate::store::AlertStore;
use crate::types::{Alert, Fingerprint, LabelSet, RawAlert};

/// Routes, groups, mutes and delivers alerts.
#[derive(Debug)]
pub struct NotificationEngine {
    settings: EngineSettings,
    shared: SharedState,
    reloader: Arc<ConfigReloader>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl NotificationEngine {
    /// Creates an engine with the built-in integration types.
    ///
    /// Silences and the notification log are restored from `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the data directory
    /// cannot be created.
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Self::with_registry(settings, IntegrationRegistry::default())
    }

    /// Creates an engine with a custom integration registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the data directory
    /// cannot be created.
    pub fn with_registry(settings: EngineSettings, registry: IntegrationRegistry) -> Result<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.data_dir)?;

        let retention = settings.state_retention();
        let shared = SharedState {
            alerts: Arc::new(AlertStore::new()),
            silences: Arc::new(SilenceStore::with_snapshot(&settings.data_dir, retention)),
            nflog: Arc::new(NotificationLog::with_snapshot(&settings.data_dir, retention)),
            marker: Arc::new(Marker::new()),
        };
        let reloader = Arc::new(ConfigReloader::new(shared.clone(), registry, settings.clone()));

        info!(
            data_dir = %settings.data_dir.display(),
            silences = shared.silences.len(),
            nflog_entries = shared.nflog.len(),
            "created notification engine"
        );

        Ok(Self {
            settings,
            shared,
            reloader,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(AlertError::Shutdown)
        } else {
            Ok(())
        }
    }

    // ============ Lifecycle ============

    /// Applies the initial configuration and starts the background tasks.
    ///
    /// With no `source`, the built-in default configuration is used and
    /// polling is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial configuration cannot be loaded or
    /// applied.
    pub async fn start(&self, source: Option<Arc<dyn ConfigSource>>) -> Result<()> {
        self.ensure_running()?;

        let document = match &source {
            Some(source) => source.load().await?,
            None => ConfigDocument::default(),
        };
        self.reloader.apply(document).await?;

        self.tracker.spawn(gc_loop(
            self.shared.clone(),
            self.settings.alert_gc_interval(),
            self.settings.alert_retention(),
            self.cancel.clone(),
        ));
        self.tracker.spawn(snapshot_loop(
            self.shared.clone(),
            self.settings.snapshot_interval(),
            self.cancel.clone(),
        ));
        if let (Some(source), Some(interval)) = (source, self.settings.poll_interval()) {
            self.tracker
                .spawn(Arc::clone(&self.reloader).poll(source, interval, self.cancel.clone()));
        }

        info!("notification engine started");
        Ok(())
    }

    /// Stops every task, waits for in-flight notifications and writes a
    /// final snapshot. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down notification engine");

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.reloader.stop().await;

        log_snapshot(&self.shared).await;
        info!("notification engine stopped");
    }

    /// Runs one garbage collection pass at `now`.
    pub fn gc(&self, now: DateTime<Utc>) {
        collect_garbage(&self.shared, now, self.settings.alert_retention());
    }

    /// Writes silences and the notification log to disk.
    ///
    /// Both snapshots are attempted even if the first fails; in-memory
    /// state is never affected by a failed write.
    ///
    /// # Errors
    ///
    /// Returns the first snapshot error.
    pub async fn snapshot(&self) -> Result<()> {
        write_snapshot(self.shared.clone()).await
    }

    // ============ Alerts ============

    /// Normalizes and stores a batch of alerts.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::PartialBatch`] if some alerts were rejected;
    /// the accepted ones are stored anyway. Returns
    /// [`AlertError::Shutdown`] after shutdown.
    pub fn put_alerts(&self, batch: Vec<RawAlert>) -> Result<usize> {
        self.ensure_running()?;
        normalize::put_alerts(&self.shared.alerts, batch, Utc::now(), self.settings.resolve_timeout())
    }

    /// Returns every stored alert.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.shared.alerts.list()
    }

    /// Returns one alert.
    #[must_use]
    pub fn alert(&self, fingerprint: &Fingerprint) -> Option<Alert> {
        self.shared.alerts.get(fingerprint)
    }

    /// Returns why each evaluated alert was or was not muted.
    #[must_use]
    pub fn alert_statuses(&self) -> HashMap<Fingerprint, AlertStatus> {
        self.shared.marker.statuses()
    }

    /// Returns the aggregation groups of the running dispatcher.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupSnapshot> {
        self.reloader
            .current()
            .map(|rt| rt.dispatcher().groups())
            .unwrap_or_default()
    }

    // ============ Silences ============

    /// Creates a silence and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidSilence`] for an invalid request.
    pub fn create_silence(&self, request: NewSilence) -> Result<String> {
        self.shared.silences.create(request, Utc::now())
    }

    /// Expires a silence now.
    ///
    /// # Errors
    ///
    /// Returns an error if the silence does not exist or already expired.
    pub fn expire_silence(&self, id: &str) -> Result<()> {
        self.shared.silences.expire(id, Utc::now())
    }

    /// Deletes a silence.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::SilenceNotFound`] if it does not exist.
    pub fn delete_silence(&self, id: &str) -> Result<()> {
        self.shared.silences.delete(id)
    }

    /// Returns one silence.
    #[must_use]
    pub fn silence(&self, id: &str) -> Option<Silence> {
        self.shared.silences.get(id)
    }

    /// Lists silences matching `filter`.
    #[must_use]
    pub fn silences(&self, filter: &SilenceFilter) -> Vec<Silence> {
        self.shared.silences.list(filter, Utc::now())
    }

    /// Returns the IDs of silences currently muting `labels`.
    #[must_use]
    pub fn query_silences(&self, labels: &LabelSet) -> Vec<String> {
        self.shared.silences.query_active(labels, Utc::now())
    }

    // ============ Configuration ============

    /// Applies a configuration document, returning false if unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is rejected; the previous
    /// configuration keeps running.
    pub async fn apply_config(&self, document: ConfigDocument) -> Result<bool> {
        self.ensure_running()?;
        self.reloader.apply(document).await
    }

    /// Persists a document to `source`, then applies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is invalid or cannot be saved.
    pub async fn save_config(&self, source: &dyn ConfigSource, document: ConfigDocument) -> Result<bool> {
        self.ensure_running()?;
        self.reloader.save(source, document).await
    }

    /// Reloads from `source` immediately.
    ///
    /// # Errors
    ///
    /// Returns the load or apply error.
    pub async fn reload_config(&self, source: &dyn ConfigSource) -> Result<bool> {
        self.ensure_running()?;
        self.reloader.reload(source).await
    }

    /// Returns the running configuration document.
    #[must_use]
    pub fn config(&self) -> Option<ConfigDocument> {
        self.reloader.current().map(|rt| rt.document().clone())
    }

    /// Returns the fingerprint of the running configuration.
    #[must_use]
    pub fn config_hash(&self) -> Option<String> {
        self.reloader.current().map(|rt| rt.hash().to_string())
    }
}

fn collect_garbage(shared: &SharedState, now: DateTime<Utc>, alert_retention: Duration) {
    let removed = shared.alerts.gc(now, alert_retention);
    for fp in &removed {
        shared.marker.delete(fp);
    }
    let silences = shared.silences.gc(now);
    let entries = shared.nflog.gc(now);

    if !removed.is_empty() || silences > 0 || entries > 0 {
        debug!(alerts = removed.len(), silences, nflog_entries = entries, "garbage collected");
    }
}

async fn write_snapshot(shared: SharedState) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let silences = shared.silences.snapshot();
        let nflog = shared.nflog.snapshot();
        silences.and(nflog)
    })
    .await
    .map_err(|e| AlertError::Io(std::io::Error::other(e)))?
}

async fn log_snapshot(shared: &SharedState) {
    if let Err(e) = write_snapshot(shared.clone()).await {
        warn!(error = %e, "snapshot failed, will retry");
    }
}

async fn gc_loop(shared: SharedState, interval: Duration, alert_retention: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => collect_garbage(&shared, Utc::now(), alert_retention),
        }
    }
}

async fn snapshot_loop(shared: SharedState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => log_snapshot(&shared).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MuteState;
    use crate::nflog::{DeliveryOutcome, NflogKey};
    use std::collections::BTreeSet;
    use crate::silence::SilenceState;
    use crate::types::{Matcher, labels};
    use chrono::Duration as ChronoDuration;

    fn engine(dir: &std::path::Path) -> NotificationEngine {
        NotificationEngine::new(EngineSettings::with_data_dir(dir)).expect("engine")
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn start_with_default_config() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());
            engine.start(None).await.expect("start");

            assert_eq!(engine.config(), Some(ConfigDocument::default()));
            assert!(engine.config_hash().is_some());
            engine.shutdown().await;
        }

        #[tokio::test]
        async fn put_after_shutdown_is_rejected() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());
            engine.start(None).await.expect("start");
            engine.shutdown().await;
            engine.shutdown().await;

            assert!(matches!(
                engine.put_alerts(vec![RawAlert::new([("alertname", "A")])]),
                Err(AlertError::Shutdown)
            ));
        }

        #[tokio::test]
        async fn shutdown_snapshots_silences() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());
            engine.start(None).await.expect("start");
            let id = engine
                .create_silence(NewSilence::new(
                    vec![Matcher::equal("alertname", "A").expect("matcher")],
                    Utc::now() + ChronoDuration::hours(1),
                ))
                .expect("silence");
            engine.shutdown().await;

            let restarted = NotificationEngine::new(EngineSettings::with_data_dir(dir.path())).expect("restart");
            assert!(restarted.silence(&id).is_some());
        }

        #[tokio::test]
        async fn failed_snapshot_keeps_state_and_retries() {
            let dir = tempfile::tempdir().expect("tempdir");
            let data_dir = dir.path().join("state");
            let engine = engine(&data_dir);

            let id = engine
                .create_silence(NewSilence::new(
                    vec![Matcher::equal("alertname", "A").expect("matcher")],
                    Utc::now() + ChronoDuration::hours(1),
                ))
                .expect("silence");
            let key = NflogKey::new("{}:{}", "team", 0);
            engine.shared.nflog.log(
                key.clone(),
                "hash".to_string(),
                BTreeSet::new(),
                BTreeSet::new(),
                DeliveryOutcome::Delivered,
                Utc::now(),
            );

            // The state directory becomes a regular file.
            std::fs::remove_dir_all(&data_dir).expect("remove dir");
            std::fs::write(&data_dir, b"not a directory").expect("write file");
            assert!(engine.snapshot().await.is_err());

            assert_eq!(engine.query_silences(&labels([("alertname", "A")])), vec![id.clone()]);
            assert!(engine.shared.nflog.get(&key).is_some());

            std::fs::remove_file(&data_dir).expect("remove file");
            engine.snapshot().await.expect("second attempt");

            let restarted = NotificationEngine::new(EngineSettings::with_data_dir(&data_dir)).expect("restart");
            assert!(restarted.silence(&id).is_some());
            assert!(restarted.shared.nflog.get(&key).is_some());
        }

        #[test]
        fn invalid_settings_rejected() {
            let mut settings = EngineSettings::default();
            settings.alerts.resolve_timeout_secs = 0;
            assert!(NotificationEngine::new(settings).is_err());
        }
    }

    mod api_tests {
        use super::*;

        #[test]
        fn put_alerts_reports_partial_batch() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());

            let err = engine
                .put_alerts(vec![
                    RawAlert::new([("alertname", "A")]),
                    RawAlert::new(Vec::<(String, String)>::new()),
                ])
                .expect_err("second alert is invalid");

            match err {
                AlertError::PartialBatch(rejection) => {
                    assert_eq!(rejection.accepted, 1);
                    assert!(rejection.errors[0].is_none());
                    assert!(rejection.errors[1].is_some());
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(engine.alerts().len(), 1);
        }

        #[test]
        fn silence_lifecycle() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());
            let target = labels([("alertname", "A")]);

            let id = engine
                .create_silence(
                    NewSilence::new(
                        vec![Matcher::equal("alertname", "A").expect("matcher")],
                        Utc::now() + ChronoDuration::hours(1),
                    )
                    .created_by("ops")
                    .comment("maintenance"),
                )
                .expect("silence");

            assert_eq!(engine.query_silences(&target), vec![id.clone()]);
            assert_eq!(engine.silences(&SilenceFilter::default().with_state(SilenceState::Active)).len(), 1);

            engine.expire_silence(&id).expect("expire");
            assert!(engine.query_silences(&target).is_empty());
            assert!(engine.expire_silence(&id).is_err());

            engine.delete_silence(&id).expect("delete");
            assert!(engine.silence(&id).is_none());
        }

        #[test]
        fn gc_removes_old_resolved_alerts_and_statuses() {
            let dir = tempfile::tempdir().expect("tempdir");
            let engine = engine(dir.path());
            let now = Utc::now();
            let alert = Alert::new(labels([("alertname", "Old")]), now - ChronoDuration::days(10), now - ChronoDuration::days(9));
            let fp = alert.fingerprint();
            engine.shared.alerts.upsert(alert);
            engine.shared.marker.set_silenced(fp, vec!["s".into()]);
            assert_eq!(engine.alert_statuses()[&fp].state, MuteState::Suppressed);

            engine.gc(now);
            assert!(engine.alert(&fp).is_none());
            assert!(engine.alert_statuses().is_empty());
        }
    }
}
