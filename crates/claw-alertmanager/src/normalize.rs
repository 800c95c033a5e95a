//! Alert normalization.
//!
//! Turns caller-submitted [`RawAlert`]s into stored [`Alert`]s: empty label
//! and annotation values are stripped, missing time bounds are filled in and
//! the result is validated. Each alert in a batch is handled independently.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{AlertError, BatchRejection, Result, ValidationError};
use crate::store::AlertStore;
use crate::types::{Alert, RawAlert, is_valid_label_name};

/// Normalizes a single raw alert received at `now`.
///
/// `starts_at` defaults to `ends_at` when only the end is given, otherwise to
/// `now`. A missing `ends_at` becomes `max(now, starts_at) + resolve_timeout`
/// and marks the alert with `timeout = true`.
///
/// # Errors
///
/// Returns a [`ValidationError`] if no labels remain, a label name is
/// invalid, or the alert ends before it starts.
pub fn normalize(
    raw: RawAlert,
    now: DateTime<Utc>,
    resolve_timeout: Duration,
) -> std::result::Result<Alert, ValidationError> {
    let labels: crate::types::LabelSet = raw
        .labels
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let annotations = raw
        .annotations
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect();

    if labels.is_empty() {
        return Err(ValidationError::EmptyLabels);
    }
    if let Some(name) = labels.keys().find(|k| !is_valid_label_name(k)) {
        return Err(ValidationError::InvalidLabelName(name.clone()));
    }

    let starts_at = match (raw.starts_at, raw.ends_at) {
        (Some(start), _) => start,
        (None, Some(end)) => end,
        (None, None) => now,
    };

    let (ends_at, timeout) = match raw.ends_at {
        Some(end) => (end, false),
        None => {
            let timeout = chrono::Duration::from_std(resolve_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            (now.max(starts_at) + timeout, true)
        }
    };

    if ends_at < starts_at {
        return Err(ValidationError::EndsBeforeStart {
            starts_at: starts_at.to_rfc3339(),
            ends_at: ends_at.to_rfc3339(),
        });
    }

    Ok(Alert {
        labels,
        annotations,
        starts_at,
        ends_at,
        updated_at: now,
        generator_url: raw.generator_url.filter(|u| !u.is_empty()),
        timeout,
    })
}

/// Normalizes a batch and upserts every valid alert into `store`.
///
/// Returns the number of stored alerts when the whole batch was accepted.
///
/// # Errors
///
/// Returns [`AlertError::PartialBatch`] with index-aligned errors if any
/// alert was rejected. Accepted alerts are stored regardless.
pub fn put_alerts(
    store: &AlertStore,
    batch: Vec<RawAlert>,
    now: DateTime<Utc>,
    resolve_timeout: Duration,
) -> Result<usize> {
    let mut errors = Vec::with_capacity(batch.len());
    let mut accepted = 0;

    for (index, raw) in batch.into_iter().enumerate() {
        match normalize(raw, now, resolve_timeout) {
            Ok(alert) => {
                store.upsert(alert);
                accepted += 1;
                errors.push(None);
            }
            Err(e) => {
                warn!(index, error = %e, "rejected alert");
                errors.push(Some(e));
            }
        }
    }

    debug!(accepted, total = errors.len(), "processed alert batch");

    if accepted == errors.len() {
        Ok(accepted)
    } else {
        Err(AlertError::PartialBatch(BatchRejection { accepted, errors }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const TIMEOUT: Duration = Duration::from_secs(300);

    mod normalize_tests {
        use super::*;

        #[test]
        fn missing_times_default_to_now_plus_timeout() {
            let now = Utc::now();
            let alert = normalize(RawAlert::new([("alertname", "Down")]), now, TIMEOUT)
                .expect("valid");

            assert_eq!(alert.starts_at, now);
            assert_eq!(alert.ends_at, now + ChronoDuration::seconds(300));
            assert!(alert.timeout);
            assert!(!alert.resolved_at(now));
        }

        #[test]
        fn only_end_sets_start_to_end() {
            let now = Utc::now();
            let end = now - ChronoDuration::minutes(1);
            let alert = normalize(RawAlert::new([("alertname", "Down")]).ends_at(end), now, TIMEOUT)
                .expect("valid");

            assert_eq!(alert.starts_at, end);
            assert_eq!(alert.ends_at, end);
            assert!(!alert.timeout);
            assert!(alert.resolved_at(now));
        }

        #[test]
        fn empty_values_are_stripped() {
            let now = Utc::now();
            let raw = RawAlert::new([("alertname", "Down"), ("instance", "")])
                .annotation("summary", "")
                .annotation("runbook", "http://wiki");
            let alert = normalize(raw, now, TIMEOUT).expect("valid");

            assert_eq!(alert.labels.len(), 1);
            assert_eq!(alert.annotations.len(), 1);
        }

        #[test]
        fn all_empty_labels_rejected() {
            let err = normalize(RawAlert::new([("alertname", "")]), Utc::now(), TIMEOUT)
                .expect_err("should reject");
            assert_eq!(err, ValidationError::EmptyLabels);
        }

        #[test]
        fn invalid_label_name_rejected() {
            let err = normalize(RawAlert::new([("bad-name", "x")]), Utc::now(), TIMEOUT)
                .expect_err("should reject");
            assert_eq!(err, ValidationError::InvalidLabelName("bad-name".into()));
        }

        #[test]
        fn ends_before_start_rejected() {
            let now = Utc::now();
            let raw = RawAlert::new([("alertname", "Down")])
                .starts_at(now)
                .ends_at(now - ChronoDuration::minutes(1));
            let err = normalize(raw, now, TIMEOUT).expect_err("should reject");
            assert!(matches!(err, ValidationError::EndsBeforeStart { .. }));
        }
    }

    mod batch_tests {
        use super::*;

        #[test]
        fn whole_batch_accepted() {
            let store = AlertStore::new();
            let batch = vec![
                RawAlert::new([("alertname", "A")]),
                RawAlert::new([("alertname", "B")]),
            ];
            let stored = put_alerts(&store, batch, Utc::now(), TIMEOUT).expect("accepted");
            assert_eq!(stored, 2);
            assert_eq!(store.len(), 2);
        }

        #[test]
        fn partial_failure_keeps_valid_alerts() {
            let store = AlertStore::new();
            let batch = vec![
                RawAlert::new([("alertname", "A")]),
                RawAlert::default(),
                RawAlert::new([("alertname", "C")]),
            ];

            let err = put_alerts(&store, batch, Utc::now(), TIMEOUT).expect_err("partial");
            let AlertError::PartialBatch(rejection) = err else {
                panic!("expected partial batch error");
            };

            assert_eq!(rejection.accepted, 2);
            assert_eq!(rejection.errors.len(), 3);
            assert!(rejection.errors[0].is_none());
            assert_eq!(rejection.errors[1], Some(ValidationError::EmptyLabels));
            assert!(rejection.errors[2].is_none());
            assert_eq!(store.len(), 2);
        }

        #[test]
        fn resubmission_is_idempotent() {
            let store = AlertStore::new();
            let now = Utc::now();
            let first = RawAlert::new([("alertname", "A"), ("instance", "h1")]).annotation("v", "1");
            let second = RawAlert::new([("instance", "h1"), ("alertname", "A")]).annotation("v", "2");

            put_alerts(&store, vec![first], now, TIMEOUT).expect("accepted");
            put_alerts(&store, vec![second], now, TIMEOUT).expect("accepted");

            let alerts = store.list();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].annotations.get("v").map(String::as_str), Some("2"));
        }
    }
}
