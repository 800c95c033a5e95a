//! Inhibition rules.
//!
//! An alert matching a rule's target matchers is inhibited while some other
//! firing alert matches the rule's source matchers and agrees with it on
//! every `equal` label. Evaluation scans the live alert store each time, so
//! an inhibition lifts as soon as its source resolves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::AlertStore;
use crate::types::{Alert, Fingerprint, LabelSet, Matcher, matches_all};

/// A single inhibition rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InhibitRule {
    /// Matchers selecting the inhibiting (source) alerts.
    #[serde(default)]
    pub source_matchers: Vec<Matcher>,
    /// Matchers selecting the inhibited (target) alerts.
    #[serde(default)]
    pub target_matchers: Vec<Matcher>,
    /// Labels whose values must be equal on source and target.
    #[serde(default)]
    pub equal: Vec<String>,
}

impl InhibitRule {
    /// Returns true if `source` may inhibit `target` under this rule.
    ///
    /// A missing label is equal only to another missing label.
    #[must_use]
    pub fn applies(&self, source: &LabelSet, target: &LabelSet) -> bool {
        matches_all(&self.source_matchers, source)
            && self.equal.iter().all(|name| source.get(name) == target.get(name))
    }
}

/// Evaluates inhibition rules against the alert store.
#[derive(Debug, Clone)]
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
    alerts: Arc<AlertStore>,
}

impl Inhibitor {
    /// Creates an evaluator over `alerts`.
    #[must_use]
    pub fn new(rules: Vec<InhibitRule>, alerts: Arc<AlertStore>) -> Self {
        Self { rules, alerts }
    }

    /// Returns the configured rules.
    #[must_use]
    pub fn rules(&self) -> &[InhibitRule] {
        &self.rules
    }

    /// Returns true if `alert` is inhibited at `now`.
    #[must_use]
    pub fn is_inhibited(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        !self.inhibited_by(&alert.labels, now).is_empty()
    }

    /// Returns the fingerprints of firing alerts that inhibit `target`.
    #[must_use]
    pub fn inhibited_by(&self, target: &LabelSet, now: DateTime<Utc>) -> Vec<Fingerprint> {
        if !self.rules.iter().any(|r| matches_all(&r.target_matchers, target)) {
            return Vec::new();
        }
        let firing = self.alerts.firing(now);
        self.inhibited_by_sources(target, &firing)
    }

    /// Like [`inhibited_by`](Self::inhibited_by), against a pre-fetched set of
    /// firing alerts. Used to evaluate a whole batch against one snapshot.
    #[must_use]
    pub fn inhibited_by_sources(&self, target: &LabelSet, firing: &[Alert]) -> Vec<Fingerprint> {
        let target_fp = Fingerprint::of(target);
        let mut sources: Vec<Fingerprint> = self
            .rules
            .iter()
            .filter(|rule| matches_all(&rule.target_matchers, target))
            .flat_map(|rule| {
                firing
                    .iter()
                    .filter(move |source| rule.applies(&source.labels, target))
            })
            .map(Alert::fingerprint)
            .filter(|fp| *fp != target_fp)
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Returns a snapshot of currently firing alerts for batch evaluation.
    #[must_use]
    pub fn firing_sources(&self, now: DateTime<Utc>) -> Vec<Alert> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        self.alerts.firing(now)
    }
}
