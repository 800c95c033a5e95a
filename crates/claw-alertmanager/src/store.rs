//! The alert store.
//!
//! Holds every known alert keyed by label fingerprint. Writers are the
//! normalizer (upserts) and the GC loop; readers are the dispatcher, the
//! inhibition evaluator and the public query API. Every upsert is broadcast
//! to subscribers so the dispatcher can route it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Alert, Fingerprint};

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 4096;

/// In-memory alert store with update notifications.
#[derive(Debug)]
pub struct AlertStore {
    alerts: RwLock<HashMap<Fingerprint, Alert>>,
    updates: broadcast::Sender<Alert>,
}

impl AlertStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            alerts: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Inserts or updates an alert, returning the stored version.
    ///
    /// Labels are the identity: an existing entry with the same fingerprint
    /// is replaced. If the existing alert was still active when the update
    /// started, its earlier `starts_at` is kept.
    pub fn upsert(&self, mut alert: Alert) -> Alert {
        let fp = alert.fingerprint();
        let mut alerts = self.alerts.write();

        if let Some(existing) = alerts.get(&fp) {
            if existing.ends_at >= alert.starts_at && existing.starts_at < alert.starts_at {
                alert.starts_at = existing.starts_at;
            }
        }

        alerts.insert(fp, alert.clone());
        // Sending under the lock keeps subscribe_with_snapshot gap-free.
        let _ = self.updates.send(alert.clone());
        drop(alerts);

        debug!(fingerprint = %fp, alertname = %alert.name(), "stored alert");
        alert
    }

    /// Gets an alert by fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Alert> {
        self.alerts.read().get(fingerprint).cloned()
    }

    /// Returns all alerts.
    #[must_use]
    pub fn list(&self) -> Vec<Alert> {
        self.alerts.read().values().cloned().collect()
    }

    /// Returns all alerts that are firing at `now`.
    #[must_use]
    pub fn firing(&self, now: DateTime<Utc>) -> Vec<Alert> {
        self.alerts
            .read()
            .values()
            .filter(|a| !a.resolved_at(now))
            .cloned()
            .collect()
    }

    /// Returns the number of stored alerts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    /// Subscribes to future upserts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.updates.subscribe()
    }

    /// Subscribes to future upserts and returns the current contents.
    ///
    /// No upsert can fall between the snapshot and the subscription.
    #[must_use]
    pub fn subscribe_with_snapshot(&self) -> (Vec<Alert>, broadcast::Receiver<Alert>) {
        let alerts = self.alerts.read();
        let rx = self.updates.subscribe();
        (alerts.values().cloned().collect(), rx)
    }

    /// Removes alerts that resolved more than `retention` before `now`.
    ///
    /// Returns the fingerprints that were removed.
    pub fn gc(&self, now: DateTime<Utc>, retention: Duration) -> Vec<Fingerprint> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        self.alerts.write().retain(|fp, alert| {
            let keep = !alert.resolved_at(now)
                || alert
                    .ends_at
                    .checked_add_signed(retention)
                    .is_none_or(|expiry| expiry > now);
            if !keep {
                removed.push(*fp);
            }
            keep
        });
        removed
    }
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels;
    use chrono::Duration as ChronoDuration;

    fn alert(now: DateTime<Utc>, ends_in_mins: i64) -> Alert {
        Alert::new(
            labels([("alertname", "Down"), ("instance", "host1")]),
            now,
            now + ChronoDuration::minutes(ends_in_mins),
        )
    }

    #[test]
    fn upsert_same_labels_replaces() {
        let store = AlertStore::new();
        let now = Utc::now();

        let mut first = alert(now, 5);
        first.annotations.insert("summary".into(), "one".into());
        store.upsert(first.clone());

        let mut second = alert(now, 10);
        second.annotations.insert("summary".into(), "two".into());
        store.upsert(second);

        assert_eq!(store.len(), 1);
        let stored = store.get(&first.fingerprint()).expect("stored");
        assert_eq!(stored.annotations.get("summary").map(String::as_str), Some("two"));
    }

    #[test]
    fn upsert_keeps_earlier_start_while_active() {
        let store = AlertStore::new();
        let now = Utc::now();
        store.upsert(alert(now, 5));

        let mut later = alert(now + ChronoDuration::minutes(2), 5);
        later.starts_at = now + ChronoDuration::minutes(2);
        let stored = store.upsert(later);

        assert_eq!(stored.starts_at, now);
    }

    #[test]
    fn upsert_after_resolution_starts_fresh() {
        let store = AlertStore::new();
        let now = Utc::now();
        store.upsert(alert(now, 1));

        let restart = now + ChronoDuration::minutes(10);
        let stored = store.upsert(Alert::new(
            labels([("alertname", "Down"), ("instance", "host1")]),
            restart,
            restart + ChronoDuration::minutes(5),
        ));

        assert_eq!(stored.starts_at, restart);
    }

    #[test]
    fn firing_excludes_resolved() {
        let store = AlertStore::new();
        let now = Utc::now();
        store.upsert(alert(now, 5));
        store.upsert(Alert::new(labels([("alertname", "Gone")]), now, now));

        let firing = store.firing(now);
        assert_eq!(firing.len(), 1);
        assert_eq!(firing[0].name(), "Down");
    }

    #[test]
    fn gc_removes_only_expired_resolved() {
        let store = AlertStore::new();
        let now = Utc::now();
        store.upsert(alert(now, 5));
        store.upsert(Alert::new(
            labels([("alertname", "Old")]),
            now - ChronoDuration::hours(3),
            now - ChronoDuration::hours(2),
        ));
        store.upsert(Alert::new(
            labels([("alertname", "Recent")]),
            now - ChronoDuration::minutes(3),
            now - ChronoDuration::minutes(1),
        ));

        let removed = store.gc(now, Duration::from_secs(3600));
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_upserts() {
        let store = AlertStore::new();
        let now = Utc::now();
        store.upsert(alert(now, 5));

        let (snapshot, mut rx) = store.subscribe_with_snapshot();
        assert_eq!(snapshot.len(), 1);

        store.upsert(Alert::new(labels([("alertname", "Other")]), now, now));
        let received = rx.recv().await.expect("update");
        assert_eq!(received.name(), "Other");
    }
}
