//! Silences and the silence store.
//!
//! A [`Silence`] mutes every alert its matchers select while the current time
//! falls within `[starts_at, ends_at)`. The [`SilenceStore`] keeps silences
//! in memory and snapshots them to `silences.json` through [`JsonStore`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::types::{LabelSet, Matcher, matches_all};

/// Lifecycle state of a silence at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceState {
    /// `starts_at` is in the future.
    Pending,
    /// The silence is in effect.
    Active,
    /// `ends_at` has passed.
    Expired,
}

impl SilenceState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SilenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A time-bounded rule that mutes matching alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Silence {
    /// Unique ID.
    pub id: String,
    /// All matchers must match for an alert to be silenced.
    pub matchers: Vec<Matcher>,
    /// Start of the silence window (inclusive).
    pub starts_at: DateTime<Utc>,
    /// End of the silence window (exclusive).
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Silence {
    /// Returns the state of the silence at `now`.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> SilenceState {
        if now < self.starts_at {
            SilenceState::Pending
        } else if now < self.ends_at {
            SilenceState::Active
        } else {
            SilenceState::Expired
        }
    }

    /// Returns true if the silence is in effect at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == SilenceState::Active
    }

    /// Returns true if the silence's matchers select the given labels.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        matches_all(&self.matchers, labels)
    }
}

/// A request to create a silence.
#[derive(Debug, Clone)]
pub struct NewSilence {
    matchers: Vec<Matcher>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: DateTime<Utc>,
    created_by: String,
    comment: String,
}

impl NewSilence {
    /// Creates a silence request ending at `ends_at`, starting immediately.
    #[must_use]
    pub fn new(matchers: Vec<Matcher>, ends_at: DateTime<Utc>) -> Self {
        Self {
            matchers,
            starts_at: None,
            ends_at,
            created_by: String::new(),
            comment: String::new(),
        }
    }

    /// Sets the start time.
    #[must_use]
    pub const fn starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = Some(at);
        self
    }

    /// Sets the author.
    #[must_use]
    pub fn created_by(mut self, author: impl Into<String>) -> Self {
        self.created_by = author.into();
        self
    }

    /// Sets the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Filter for [`SilenceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct SilenceFilter {
    /// Only silences in this state.
    pub state: Option<SilenceState>,
    /// Only silences whose matchers select these labels.
    pub labels: Option<LabelSet>,
}

impl SilenceFilter {
    /// Filters by state.
    #[must_use]
    pub fn with_state(mut self, state: SilenceState) -> Self {
        self.state = Some(state);
        self
    }

    /// Filters by matching labels.
    #[must_use]
    pub fn matching(mut self, labels: LabelSet) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// Stores silences and answers "which silences mute these labels now?".
#[derive(Debug)]
pub struct SilenceStore {
    silences: RwLock<HashMap<String, Silence>>,
    retention: Duration,
    snapshot: Option<JsonStore>,
}

impl SilenceStore {
    /// Creates an in-memory store without snapshots.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            silences: RwLock::new(HashMap::new()),
            retention,
            snapshot: None,
        }
    }

    /// Creates a store backed by `<dir>/silences.json`, loading the last
    /// snapshot if there is one.
    #[must_use]
    pub fn with_snapshot(dir: &Path, retention: Duration) -> Self {
        let store = JsonStore::new(dir, "silences");
        let loaded: Vec<Silence> = store.load();
        let count = loaded.len();
        let silences = loaded.into_iter().map(|s| (s.id.clone(), s)).collect();

        info!(path = %store.path().display(), count, "loaded silences");

        Self {
            silences: RwLock::new(silences),
            retention,
            snapshot: Some(store),
        }
    }

    /// Creates a silence and returns its ID.
    ///
    /// A start time in the past is moved to `now`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidSilence` if there are no matchers or the
    /// silence would already be over.
    pub fn create(&self, request: NewSilence, now: DateTime<Utc>) -> Result<String> {
        if request.matchers.is_empty() {
            return Err(AlertError::InvalidSilence {
                reason: "at least one matcher is required".to_string(),
            });
        }

        let starts_at = request.starts_at.map_or(now, |s| s.max(now));
        if request.ends_at <= starts_at {
            return Err(AlertError::InvalidSilence {
                reason: "end time must be after start time and in the future".to_string(),
            });
        }

        let silence = Silence {
            id: Uuid::new_v4().to_string(),
            matchers: request.matchers,
            starts_at,
            ends_at: request.ends_at,
            created_by: request.created_by,
            comment: request.comment,
            updated_at: now,
        };
        let id = silence.id.clone();

        info!(
            silence_id = %id,
            created_by = %silence.created_by,
            matchers = silence.matchers.len(),
            "created silence"
        );
        self.silences.write().insert(id.clone(), silence);

        Ok(id)
    }

    /// Expires a silence.
    ///
    /// An active silence ends at `now`; a pending one ends at its start so
    /// that it never takes effect.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::SilenceNotFound` for an unknown ID and
    /// `AlertError::InvalidSilence` if it has already expired.
    pub fn expire(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut silences = self.silences.write();
        let silence = silences.get_mut(id).ok_or_else(|| AlertError::SilenceNotFound {
            id: id.to_string(),
        })?;

        match silence.state_at(now) {
            SilenceState::Expired => {
                return Err(AlertError::InvalidSilence {
                    reason: format!("silence {id} already expired"),
                });
            }
            SilenceState::Pending => silence.ends_at = silence.starts_at,
            SilenceState::Active => silence.ends_at = now,
        }
        silence.updated_at = now;

        info!(silence_id = %id, "expired silence");
        Ok(())
    }

    /// Deletes a silence outright.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::SilenceNotFound` for an unknown ID.
    pub fn delete(&self, id: &str) -> Result<()> {
        if self.silences.write().remove(id).is_none() {
            return Err(AlertError::SilenceNotFound { id: id.to_string() });
        }
        info!(silence_id = %id, "deleted silence");
        Ok(())
    }

    /// Gets a silence by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Silence> {
        self.silences.read().get(id).cloned()
    }

    /// Returns the IDs of silences muting `labels` at `now`, sorted.
    #[must_use]
    pub fn query_active(&self, labels: &LabelSet, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .silences
            .read()
            .values()
            .filter(|s| s.is_active_at(now) && s.matches(labels))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Lists silences selected by `filter`, ordered by start time.
    #[must_use]
    pub fn list(&self, filter: &SilenceFilter, now: DateTime<Utc>) -> Vec<Silence> {
        let mut result: Vec<Silence> = self
            .silences
            .read()
            .values()
            .filter(|s| filter.state.is_none_or(|state| s.state_at(now) == state))
            .filter(|s| filter.labels.as_ref().is_none_or(|l| s.matches(l)))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));
        result
    }

    /// Returns the number of silences, including expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.silences.read().len()
    }

    /// Returns true if there are no silences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.silences.read().is_empty()
    }

    /// Drops silences that expired more than the retention window ago.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let mut silences = self.silences.write();
        let before = silences.len();
        silences.retain(|_, s| {
            s.ends_at
                .checked_add_signed(retention)
                .is_none_or(|expiry| expiry > now)
        });
        let removed = before - silences.len();
        if removed > 0 {
            debug!(removed, "garbage collected silences");
        }
        removed
    }

    /// Writes all silences to the snapshot file, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written; in-memory state
    /// is unaffected.
    pub fn snapshot(&self) -> Result<()> {
        let Some(store) = &self.snapshot else {
            return Ok(());
        };

        let mut silences: Vec<Silence> = self.silences.read().values().cloned().collect();
        silences.sort_by(|a, b| a.id.cmp(&b.id));

        store.save(&silences).map_err(|e| {
            warn!(path = %store.path().display(), error = %e, "failed to save silences");
            AlertError::from(e)
        })?;
        debug!(count = silences.len(), "saved silences snapshot");
        Ok(())
    }
}
