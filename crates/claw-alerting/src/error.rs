//! Error types for the claw-alerting crate.

use thiserror::Error;

/// Errors that can occur in rule evaluation and alert lifecycle handling.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Invalid alert rule configuration.
    #[error("invalid alert rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// Alert rule with the given ID was not found.
    #[error("rule not found: {id}")]
    RuleNotFound {
        /// The rule ID that was not found.
        id: String,
    },

    /// Alert with the given ID was not found.
    #[error("alert not found: {id}")]
    AlertNotFound {
        /// The alert ID that was not found.
        id: String,
    },

    /// The evaluator could not produce a sample.
    #[error("evaluator unavailable: {reason}")]
    EvaluatorUnavailable {
        /// The reason the evaluator failed.
        reason: String,
    },

    /// The evaluator did not answer before the evaluation deadline.
    #[error("evaluation timed out after {timeout_ms}ms")]
    EvaluatorTimeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A versioned write lost against a concurrent writer.
    #[error("persistence conflict on alert {alert_id}: expected version {expected}, found {found}")]
    PersistenceConflict {
        /// The alert that was being written.
        alert_id: String,
        /// The version the writer read.
        expected: u64,
        /// The version currently stored.
        found: u64,
    },

    /// An open alert already exists for the fingerprint.
    #[error("open alert already exists for fingerprint {fingerprint}")]
    DuplicateFingerprint {
        /// The contested fingerprint.
        fingerprint: String,
    },

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid duration.
    #[error("invalid duration: {reason}")]
    InvalidDuration {
        /// The reason the duration is invalid.
        reason: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AlertError {
    /// Returns true if the error is an optimistic-lock loss that may succeed on retry.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::PersistenceConflict { .. })
    }
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for alerting operations.
pub type Result<T> = std::result::Result<T, AlertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_rule() {
        let err = AlertError::InvalidRule {
            reason: "interval must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid alert rule: interval must be positive"
        );
    }

    #[test]
    fn error_display_alert_not_found() {
        let err = AlertError::AlertNotFound {
            id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "alert not found: abc-123");
    }

    #[test]
    fn error_display_timeout() {
        let err = AlertError::EvaluatorTimeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "evaluation timed out after 1500ms");
    }

    #[test]
    fn error_display_conflict() {
        let err = AlertError::PersistenceConflict {
            alert_id: "a1".to_string(),
            expected: 3,
            found: 4,
        };
        assert_eq!(
            err.to_string(),
            "persistence conflict on alert a1: expected version 3, found 4"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let err = AlertError::Storage("disk full".to_string());
        assert!(!err.is_conflict());
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let alert_err: AlertError = json_err.unwrap_err().into();
        assert!(matches!(alert_err, AlertError::Serialization(_)));
    }
}
