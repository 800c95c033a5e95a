//! Error types for the claw-alertmanager crate.

use thiserror::Error;

/// Errors that can occur in the notification engine.
#[derive(Debug, Error)]
pub enum AlertError {
    /// One or more alerts in a submitted batch failed validation.
    #[error("{} of {} alerts rejected", .0.rejected(), .0.errors.len())]
    PartialBatch(BatchRejection),

    /// Invalid configuration document or engine settings.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// A label matcher could not be parsed or compiled.
    #[error("invalid matcher '{input}': {reason}")]
    InvalidMatcher {
        /// The matcher text as given.
        input: String,
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// A template could not be parsed or rendered.
    #[error("template '{name}': {reason}")]
    Template {
        /// The template name.
        name: String,
        /// The reason the template failed.
        reason: String,
    },

    /// Silence with the given ID was not found.
    #[error("silence not found: {id}")]
    SilenceNotFound {
        /// The silence ID that was not found.
        id: String,
    },

    /// Invalid silence specification.
    #[error("invalid silence: {reason}")]
    InvalidSilence {
        /// The reason the silence is invalid.
        reason: String,
    },

    /// A notification could not be delivered after retries.
    #[error("notification to {integration} failed: {source}")]
    Delivery {
        /// The `receiver/type[index]` identity of the integration.
        integration: String,
        /// The final send error.
        #[source]
        source: SendError,
    },

    /// The engine has been shut down.
    #[error("engine is shut down")]
    Shutdown,

    /// Reading or writing persisted state failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl AlertError {
    /// Shorthand for an [`AlertError::InvalidConfig`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for alertmanager operations.
pub type Result<T> = std::result::Result<T, AlertError>;

/// Why a single inbound alert was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No labels remained after empty values were stripped.
    #[error("alert has no labels")]
    EmptyLabels,

    /// A label name is not a valid identifier.
    #[error("invalid label name '{0}'")]
    InvalidLabelName(String),

    /// The alert ends before it starts.
    #[error("end time {ends_at} is before start time {starts_at}")]
    EndsBeforeStart {
        /// RFC 3339 start time.
        starts_at: String,
        /// RFC 3339 end time.
        ends_at: String,
    },
}

/// Per-alert outcome of a partially rejected batch.
///
/// `errors` is index-aligned with the submitted batch: `None` means the alert
/// at that position was accepted and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRejection {
    /// Number of alerts that were accepted.
    pub accepted: usize,
    /// Index-aligned validation errors.
    pub errors: Vec<Option<ValidationError>>,
}

impl BatchRejection {
    /// Returns the number of rejected alerts.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    /// Iterates over `(index, error)` for every rejected alert.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &ValidationError)> {
        self.errors
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }
}

/// A failed attempt to hand a notification to an external system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct SendError {
    /// Whether retrying the same payload may succeed.
    pub retryable: bool,
    /// Human-readable failure description.
    pub reason: String,
}

impl SendError {
    /// A transient failure (timeout, connection reset, 5xx, 429).
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    /// A permanent failure that retrying will not fix (bad request, auth).
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }

    /// Classifies an HTTP status code returned by a receiver endpoint.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let reason = format!("unexpected status code {status}: {body}");
        if status == 429 || status >= 500 {
            Self::retryable(reason)
        } else {
            Self::permanent(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_invalid_config() {
        let err = AlertError::config("receiver 'ops' is not defined");
        assert_eq!(
            err.to_string(),
            "invalid configuration: receiver 'ops' is not defined"
        );
    }

    #[test]
    fn error_display_silence_not_found() {
        let err = AlertError::SilenceNotFound {
            id: "silence-123".to_string(),
        };
        assert_eq!(err.to_string(), "silence not found: silence-123");
    }

    #[test]
    fn error_display_partial_batch() {
        let err = AlertError::PartialBatch(BatchRejection {
            accepted: 2,
            errors: vec![None, Some(ValidationError::EmptyLabels), None],
        });
        assert_eq!(err.to_string(), "1 of 3 alerts rejected");
    }

    #[test]
    fn batch_rejection_failures_keep_indices() {
        let rejection = BatchRejection {
            accepted: 1,
            errors: vec![
                Some(ValidationError::EmptyLabels),
                None,
                Some(ValidationError::InvalidLabelName("1abc".to_string())),
            ],
        };
        let indices: Vec<usize> = rejection.failures().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(rejection.rejected(), 2);
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let alert_err: AlertError = json_err.unwrap_err().into();
        assert!(matches!(alert_err, AlertError::SerializationError(_)));
    }

    #[test_case(500, true ; "server error retries")]
    #[test_case(503, true ; "unavailable retries")]
    #[test_case(429, true ; "rate limited retries")]
    #[test_case(400, false ; "bad request is permanent")]
    #[test_case(401, false ; "unauthorized is permanent")]
    #[test_case(404, false ; "not found is permanent")]
    fn send_error_from_status(status: u16, retryable: bool) {
        assert_eq!(SendError::from_status(status, "").retryable, retryable);
    }
}
