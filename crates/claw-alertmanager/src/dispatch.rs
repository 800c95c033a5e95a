//! The dispatcher.
//!
//! Subscribes to the alert store, matches every alert against the routing
//! tree and keeps one aggregation group per `(route, group labels)`. Each
//! group runs its own task:
//!
//! ```text
//! created ─ group_wait ─► flush ─ group_interval ─► flush ─ … ─► empty ─► removed
//! ```
//!
//! Flushes of one group are sequential; groups flush independently of each
//! other. Stopping the dispatcher lets in-flight flushes finish.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::pipeline::{NotifyContext, Stage};
use crate::route::{Route, RouteTimings};
use crate::store::AlertStore;
use crate::types::{Alert, Fingerprint, LabelSet};

/// Timing options of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// How often empty groups are checked for removal.
    pub maintenance_interval: Duration,
    /// How long a group may stay empty before removal.
    pub empty_group_retention: Duration,
    /// How long resolved alerts stay in a group.
    pub alert_retention: Duration,
}

impl From<&EngineSettings> for DispatchOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            maintenance_interval: Duration::from_millis(settings.dispatch.maintenance_interval_ms),
            empty_group_retention: Duration::from_secs(settings.dispatch.empty_group_retention_secs),
            alert_retention: settings.alert_retention(),
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

/// Point-in-time view of an aggregation group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    /// Group key.
    pub key: String,
    /// Receiver name.
    pub receiver: String,
    /// Labels the group is keyed on.
    pub labels: LabelSet,
    /// Alerts currently held, ordered by fingerprint.
    pub alerts: Vec<Alert>,
}

fn expired(alert: &Alert, now: DateTime<Utc>, retention: Duration) -> bool {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return false;
    };
    alert.resolved_at(now)
        && alert
            .ends_at
            .checked_add_signed(retention)
            .is_some_and(|expiry| expiry <= now)
}

#[derive(Debug)]
struct AggrGroup {
    key: String,
    receiver: String,
    labels: LabelSet,
    timings: RouteTimings,
    alerts: Mutex<HashMap<Fingerprint, Alert>>,
    empty_since: Mutex<Option<Instant>>,
    flushed: AtomicBool,
    flush_now: Notify,
    cancel: CancellationToken,
}

impl AggrGroup {
    fn new(route: &Route, labels: LabelSet, cancel: CancellationToken) -> Self {
        Self {
            key: route.group_key(&labels),
            receiver: route.receiver().to_string(),
            labels,
            timings: route.timings(),
            alerts: Mutex::new(HashMap::new()),
            empty_since: Mutex::new(None),
            flushed: AtomicBool::new(false),
            flush_now: Notify::new(),
            cancel,
        }
    }

    fn insert(&self, alert: Alert, now: DateTime<Utc>) {
        // An alert that has already waited out group_wait upstream should
        // not wait again on a group that never flushed.
        let overdue = chrono::Duration::from_std(self.timings.group_wait)
            .ok()
            .and_then(|wait| alert.starts_at.checked_add_signed(wait))
            .is_some_and(|due| due < now);

        self.alerts.lock().insert(alert.fingerprint(), alert);
        *self.empty_since.lock() = None;

        if overdue && !self.flushed.load(Ordering::Acquire) {
            self.flush_now.notify_one();
        }
    }

    fn snapshot(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.lock().values().cloned().collect();
        alerts.sort_by_key(Alert::fingerprint);
        alerts
    }

    /// Drops resolved alerts past retention; returns true if the group is empty.
    fn prune(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        let mut alerts = self.alerts.lock();
        alerts.retain(|_, alert| !expired(alert, now, retention));
        let empty = alerts.is_empty();
        drop(alerts);

        let mut empty_since = self.empty_since.lock();
        if empty {
            empty_since.get_or_insert_with(Instant::now);
        } else {
            *empty_since = None;
        }
        empty
    }

    fn empty_for(&self, retention: Duration) -> bool {
        self.empty_since
            .lock()
            .is_some_and(|since| since.elapsed() >= retention)
    }

    async fn run(self: Arc<Self>, stage: Arc<dyn Stage>, retention: Duration) {
        let mut next = Instant::now() + self.timings.group_wait;
        loop {
            let flushed = self.flushed.load(Ordering::Acquire);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep_until(next) => {}
                () = self.flush_now.notified(), if !flushed => {
                    debug!(group_key = %self.key, "flushing early");
                }
            }
            next = Instant::now() + self.timings.group_interval;
            self.flush(&stage, retention).await;
        }
        debug!(group_key = %self.key, "aggregation group stopped");
    }

    async fn flush(&self, stage: &Arc<dyn Stage>, retention: Duration) {
        let now = Utc::now();
        self.prune(now, retention);
        let alerts = self.snapshot();
        if alerts.is_empty() {
            return;
        }
        self.flushed.store(true, Ordering::Release);

        debug!(group_key = %self.key, receiver = %self.receiver, alerts = alerts.len(), "flushing group");
        let mut ctx = NotifyContext::new(&self.receiver, &self.key, self.labels.clone(), self.timings, now);
        match AssertUnwindSafe(stage.exec(&mut ctx, alerts)).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(group_key = %self.key, error = %e, "flush failed"),
            Err(_) => error!(group_key = %self.key, "flush panicked, retrying on next tick"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    route: Arc<Route>,
    stage: Arc<dyn Stage>,
    alerts: Arc<AlertStore>,
    options: DispatchOptions,
    groups: Mutex<HashMap<String, Arc<AggrGroup>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn process(&self, alert: &Alert) {
        let now = Utc::now();
        if expired(alert, now, self.options.alert_retention) {
            return;
        }

        for route in self.route.match_labels(&alert.labels) {
            let labels = route.group_labels(&alert.labels);
            let key = route.group_key(&labels);

            let mut groups = self.groups.lock();
            let group = groups.entry(key).or_insert_with(|| {
                let group = Arc::new(AggrGroup::new(route, labels, self.cancel.child_token()));
                debug!(group_key = %group.key, receiver = %group.receiver, "created aggregation group");
                self.tracker.spawn(
                    Arc::clone(&group).run(Arc::clone(&self.stage), self.options.alert_retention),
                );
                group
            });
            group.insert(alert.clone(), now);
        }
    }

    fn maintain(&self) {
        let now = Utc::now();
        let mut groups = self.groups.lock();
        groups.retain(|key, group| {
            let remove = group.prune(now, self.options.alert_retention)
                && group.empty_for(self.options.empty_group_retention);
            if remove {
                group.cancel.cancel();
                debug!(group_key = %key, "removed empty aggregation group");
            }
            !remove
        });
    }

    async fn run(self: Arc<Self>) {
        let (snapshot, mut updates) = self.alerts.subscribe_with_snapshot();
        for alert in &snapshot {
            self.process(alert);
        }
        info!(alerts = snapshot.len(), "dispatcher started");

        let mut maintenance = tokio::time::interval(self.options.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                received = updates.recv() => match received {
                    Ok(alert) => self.process(&alert),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatcher lagged behind alert updates, resyncing");
                        let (snapshot, resubscribed) = self.alerts.subscribe_with_snapshot();
                        updates = resubscribed;
                        for alert in &snapshot {
                            self.process(alert);
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = maintenance.tick() => self.maintain(),
            }
        }
        info!("dispatcher stopped");
    }
}

/// Groups alerts and drives the notification pipeline.
#[derive(Debug)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Starts a dispatcher for `route`, flushing through `stage`.
    ///
    /// Every alert already in the store is routed immediately.
    #[must_use]
    pub fn start(route: Arc<Route>, stage: Arc<dyn Stage>, alerts: Arc<AlertStore>, options: DispatchOptions) -> Self {
        let inner = Arc::new(Inner {
            route,
            stage,
            alerts,
            options,
            groups: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        inner.tracker.spawn(Arc::clone(&inner).run());
        Self { inner }
    }

    /// Returns the routing tree this dispatcher uses.
    #[must_use]
    pub fn route(&self) -> &Arc<Route> {
        &self.inner.route
    }

    /// Returns a snapshot of every aggregation group, ordered by key.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupSnapshot> {
        let mut groups: Vec<GroupSnapshot> = self
            .inner
            .groups
            .lock()
            .values()
            .map(|g| GroupSnapshot {
                key: g.key.clone(),
                receiver: g.receiver.clone(),
                labels: g.labels.clone(),
                alerts: g.snapshot(),
            })
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }

    /// Stops the dispatcher and every group, waiting for in-flight flushes.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.groups.lock().clear();
    }
}
