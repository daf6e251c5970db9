//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};

/// Configuration for the evaluation scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduler looks for due rules (in seconds).
    pub tick_interval_secs: u64,
    /// Deadline for a single evaluator call (in seconds).
    pub evaluation_timeout_secs: u64,
    /// Maximum number of evaluations running at once.
    pub max_concurrent_evaluations: usize,
    /// Retries after losing an optimistic-lock race on an alert write.
    pub conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 15,
            evaluation_timeout_secs: 10,
            max_concurrent_evaluations: 64,
            conflict_retries: 1,
        }
    }
}

impl SchedulerConfig {
    /// Upper bound for the worker pool.
    pub const MAX_CONCURRENCY: usize = 4096;

    /// Returns the tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Returns the per-evaluation deadline.
    #[must_use]
    pub const fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(AlertError::Config("tick_interval_secs must be positive".to_string()));
        }
        if self.evaluation_timeout_secs == 0 {
            return Err(AlertError::Config(
                "evaluation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_concurrent_evaluations == 0 || self.max_concurrent_evaluations > Self::MAX_CONCURRENCY {
            return Err(AlertError::Config(format!(
                "max_concurrent_evaluations must be between 1 and {}",
                Self::MAX_CONCURRENCY
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(15));
        assert_eq!(config.evaluation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SchedulerConfig {
            evaluation_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AlertError::Config(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = SchedulerConfig {
            max_concurrent_evaluations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"tick_interval_secs": 5}"#).unwrap();
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.max_concurrent_evaluations, 64);
        assert_eq!(config.conflict_retries, 1);
    }
}
