//! The notification log.
//!
//! Records, per `(group key, receiver, integration index)`, what was last
//! sent and when. The dedup stage consults it to decide whether a flush
//! needs to go out; the log stage writes it after every terminal attempt,
//! successful or not. All writes go through one mutex, which linearizes
//! concurrent updates to the same key.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AlertError, Result};
use crate::types::{Alert, Fingerprint};

/// Identity of a notification log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NflogKey {
    /// Aggregation group key.
    pub group_key: String,
    /// Receiver name.
    pub receiver: String,
    /// Position of the integration within the receiver.
    pub integration: usize,
}

impl NflogKey {
    /// Creates a key.
    #[must_use]
    pub fn new(group_key: impl Into<String>, receiver: impl Into<String>, integration: usize) -> Self {
        Self {
            group_key: group_key.into(),
            receiver: receiver.into(),
            integration,
        }
    }
}

impl fmt::Display for NflogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group_key, self.receiver, self.integration)
    }
}

/// Result of the last delivery attempt for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    /// The integration accepted the notification.
    Delivered,
    /// Every retry failed.
    Failed,
}

/// What was last sent for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NflogEntry {
    /// Entry identity.
    pub key: NflogKey,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Content hash of the alert set (see [`content_hash`]).
    pub content_hash: String,
    /// Alerts that were firing in the notification.
    pub firing: BTreeSet<Fingerprint>,
    /// Alerts that were resolved in the notification.
    pub resolved: BTreeSet<Fingerprint>,
    /// Delivery outcome.
    pub outcome: DeliveryOutcome,
    /// When the entry becomes eligible for garbage collection.
    pub expires_at: DateTime<Utc>,
}

/// Splits alerts into firing and resolved fingerprint sets at `now`.
#[must_use]
pub fn partition(alerts: &[Alert], now: DateTime<Utc>) -> (BTreeSet<Fingerprint>, BTreeSet<Fingerprint>) {
    let mut firing = BTreeSet::new();
    let mut resolved = BTreeSet::new();
    for alert in alerts {
        if alert.resolved_at(now) {
            resolved.insert(alert.fingerprint());
        } else {
            firing.insert(alert.fingerprint());
        }
    }
    (firing, resolved)
}

/// Hashes the membership and status of an alert set.
///
/// Each alert contributes `"<fingerprint>:<firing|resolved>\n"`, in
/// fingerprint order. Annotations, timestamps and input order do not affect
/// the result.
#[must_use]
pub fn content_hash(firing: &BTreeSet<Fingerprint>, resolved: &BTreeSet<Fingerprint>) -> String {
    let mut lines: Vec<(Fingerprint, &str)> = firing
        .iter()
        .map(|fp| (*fp, "firing"))
        .chain(resolved.iter().map(|fp| (*fp, "resolved")))
        .collect();
    lines.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for (fp, status) in lines {
        hasher.update(format!("{fp}:{status}\n").as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Inputs to [`needs_update`].
#[derive(Debug, Clone, Copy)]
pub struct DedupCheck<'a> {
    /// Hash of the pending alert set.
    pub hash: &'a str,
    /// Firing fingerprints in the pending set.
    pub firing: &'a BTreeSet<Fingerprint>,
    /// Resolved fingerprints in the pending set.
    pub resolved: &'a BTreeSet<Fingerprint>,
    /// Whether the integration reports resolutions.
    pub send_resolved: bool,
    /// The route's repeat interval.
    pub repeat_interval: Duration,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

/// Decides whether a notification should be sent given the previous entry.
///
/// - Nothing sent yet: send if anything is firing.
/// - Content unchanged: send only once `repeat_interval` has passed, and
///   never for an all-resolved set.
/// - Newly firing alerts: send.
/// - Everything resolved that was previously firing: send.
/// - Newly resolved alerts: send if the integration reports resolutions.
/// - Otherwise: send once `repeat_interval` has passed.
#[must_use]
pub fn needs_update(entry: Option<&NflogEntry>, check: &DedupCheck<'_>) -> bool {
    let Some(entry) = entry else {
        return !check.firing.is_empty();
    };

    let repeat = chrono::Duration::from_std(check.repeat_interval).unwrap_or(chrono::Duration::MAX);
    let repeat_elapsed = entry
        .timestamp
        .checked_add_signed(repeat)
        .is_some_and(|due| due <= check.now);

    if entry.content_hash == check.hash {
        return !check.firing.is_empty() && repeat_elapsed;
    }
    if !check.firing.is_subset(&entry.firing) {
        return true;
    }
    if check.firing.is_empty() {
        return !entry.firing.is_empty();
    }
    if check.send_resolved && !check.resolved.is_subset(&entry.resolved) {
        return true;
    }
    repeat_elapsed
}

/// Durable log of sent notifications.
#[derive(Debug)]
pub struct NotificationLog {
    entries: Mutex<HashMap<NflogKey, NflogEntry>>,
    retention: Duration,
    snapshot: Option<JsonStore>,
}

impl NotificationLog {
    /// Creates an in-memory log without snapshots.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            snapshot: None,
        }
    }

    /// Creates a log backed by `<dir>/nflog.json`, loading the last snapshot.
    #[must_use]
    pub fn with_snapshot(dir: &Path, retention: Duration) -> Self {
        let store = JsonStore::new(dir, "nflog");
        let loaded: Vec<NflogEntry> = store.load();
        let count = loaded.len();
        let entries = loaded.into_iter().map(|e| (e.key.clone(), e)).collect();

        info!(path = %store.path().display(), count, "loaded notification log");

        Self {
            entries: Mutex::new(entries),
            retention,
            snapshot: Some(store),
        }
    }

    /// Returns the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &NflogKey) -> Option<NflogEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Records a terminal delivery attempt.
    pub fn log(
        &self,
        key: NflogKey,
        content_hash: String,
        firing: BTreeSet<Fingerprint>,
        resolved: BTreeSet<Fingerprint>,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(retention).unwrap_or(DateTime::<Utc>::MAX_UTC);

        debug!(key = %key, outcome = ?outcome, firing = firing.len(), resolved = resolved.len(), "logged notification");

        let entry = NflogEntry {
            key: key.clone(),
            timestamp: now,
            content_hash,
            firing,
            resolved,
            outcome,
            expires_at,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops entries past their expiry.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "garbage collected notification log");
        }
        removed
    }

    /// Writes all entries to the snapshot file, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn snapshot(&self) -> Result<()> {
        let Some(store) = &self.snapshot else {
            return Ok(());
        };

        let mut entries: Vec<NflogEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        store.save(&entries).map_err(|e| {
            warn!(path = %store.path().display(), error = %e, "failed to save notification log");
            AlertError::from(e)
        })?;
        debug!(count = entries.len(), "saved notification log snapshot");
        Ok(())
    }
}
