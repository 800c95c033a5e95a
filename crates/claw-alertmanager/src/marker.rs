//! Per-alert mute status.
//!
//! The mute stages record which silences and which inhibiting alerts muted
//! an alert at its last evaluation, so operators can see why a notification
//! did not go out.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Fingerprint;

/// Whether an alert was muted at its last evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteState {
    /// Not yet seen by a pipeline.
    #[default]
    Unprocessed,
    /// Neither silenced nor inhibited.
    Active,
    /// Silenced or inhibited.
    Suppressed,
}

impl fmt::Display for MuteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprocessed => "unprocessed",
            Self::Active => "active",
            Self::Suppressed => "suppressed",
        };
        f.write_str(s)
    }
}

/// Why an alert is (or is not) muted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertStatus {
    /// Overall state.
    pub state: MuteState,
    /// IDs of the silences muting the alert.
    pub silenced_by: Vec<String>,
    /// Fingerprints of the alerts inhibiting it.
    pub inhibited_by: Vec<Fingerprint>,
}

impl AlertStatus {
    fn refresh_state(&mut self) {
        self.state = if self.silenced_by.is_empty() && self.inhibited_by.is_empty() {
            MuteState::Active
        } else {
            MuteState::Suppressed
        };
    }
}

/// Shared record of alert mute statuses.
#[derive(Debug, Default)]
pub struct Marker {
    statuses: RwLock<HashMap<Fingerprint, AlertStatus>>,
}

impl Marker {
    /// Creates an empty marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the silences muting an alert (empty for none).
    ///
    /// Silenced alerts are not evaluated for inhibition, so their previous
    /// inhibition sources are cleared.
    pub fn set_silenced(&self, fp: Fingerprint, silence_ids: Vec<String>) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(fp).or_default();
        if !silence_ids.is_empty() {
            status.inhibited_by.clear();
        }
        status.silenced_by = silence_ids;
        status.refresh_state();
    }

    /// Records the alerts inhibiting an alert (empty for none).
    pub fn set_inhibited(&self, fp: Fingerprint, sources: Vec<Fingerprint>) {
        let mut statuses = self.statuses.write();
        let status = statuses.entry(fp).or_default();
        status.inhibited_by = sources;
        status.refresh_state();
    }

    /// Returns the status of one alert.
    #[must_use]
    pub fn status(&self, fp: &Fingerprint) -> AlertStatus {
        self.statuses.read().get(fp).cloned().unwrap_or_default()
    }

    /// Returns every recorded status.
    #[must_use]
    pub fn statuses(&self) -> HashMap<Fingerprint, AlertStatus> {
        self.statuses.read().clone()
    }

    /// Forgets an alert.
    pub fn delete(&self, fp: &Fingerprint) {
        self.statuses.write().remove(fp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels;

    #[test]
    fn unknown_alert_is_unprocessed() {
        let marker = Marker::new();
        let fp = Fingerprint::of(&labels([("alertname", "Down")]));
        assert_eq!(marker.status(&fp).state, MuteState::Unprocessed);
    }

    #[test]
    fn silence_then_unsilence() {
        let marker = Marker::new();
        let fp = Fingerprint::of(&labels([("alertname", "Down")]));

        marker.set_silenced(fp, vec!["s1".to_string()]);
        assert_eq!(marker.status(&fp).state, MuteState::Suppressed);

        marker.set_silenced(fp, vec![]);
        assert_eq!(marker.status(&fp).state, MuteState::Active);
    }

    #[test]
    fn inhibited_and_silenced_are_independent() {
        let marker = Marker::new();
        let fp = Fingerprint::of(&labels([("alertname", "Down")]));
        let source = Fingerprint::of(&labels([("alertname", "Root")]));

        marker.set_inhibited(fp, vec![source]);
        marker.set_silenced(fp, vec![]);
        let status = marker.status(&fp);
        assert_eq!(status.state, MuteState::Suppressed);
        assert_eq!(status.inhibited_by, vec![source]);

        marker.delete(&fp);
        assert!(marker.statuses().is_empty());
    }

    #[test]
    fn silencing_clears_inhibition_sources() {
        let marker = Marker::new();
        let fp = Fingerprint::of(&labels([("alertname", "Down")]));
        let source = Fingerprint::of(&labels([("alertname", "Root")]));

        marker.set_inhibited(fp, vec![source]);
        marker.set_silenced(fp, vec!["s1".to_string()]);
        let status = marker.status(&fp);
        assert_eq!(status.state, MuteState::Suppressed);
        assert_eq!(status.silenced_by, vec!["s1".to_string()]);
        assert!(status.inhibited_by.is_empty());
    }
}
