//! Daemon configuration.
//!
//! The daemon reads a single JSON file holding:
//! - scheduler tuning
//! - the path of the samples file the evaluator reads
//! - the rule definitions to load into the rule store

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use claw_alerting::{
    AlertError, AlertSeverity, ComparisonOperator, Result, Rule, RuleStatus, SchedulerConfig,
    StatePolicy,
};
use serde::{Deserialize, Serialize};

/// One rule as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Stable rule ID; alerts are keyed on it.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Expression handed to the evaluator.
    pub expression: String,
    /// Data source the expression runs against.
    #[serde(default)]
    pub data_source: String,
    /// Comparison operator (`>`, `>=`, `<`, `<=`, `==`, `!=`).
    pub operator: ComparisonOperator,
    /// Breach threshold.
    pub threshold: f64,
    /// Optional recovery threshold for hysteresis.
    #[serde(default)]
    pub recovery_threshold: Option<f64>,
    /// Evaluation interval in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Pending duration in seconds.
    #[serde(default)]
    pub for_secs: u64,
    /// Keep-firing duration in seconds.
    #[serde(default)]
    pub keep_firing_for_secs: u64,
    /// No-data policy.
    #[serde(default)]
    pub no_data_state: StatePolicy,
    /// Evaluator-error policy.
    #[serde(default)]
    pub exec_err_state: StatePolicy,
    /// Alert severity.
    #[serde(default)]
    pub severity: AlertSeverity,
    /// Labels; part of the alert fingerprint.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Annotations copied onto alerts.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Whether the rule is scheduled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Administrative status.
    #[serde(default)]
    pub status: RuleStatus,
}

const fn default_interval_secs() -> u64 {
    60
}

const fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    /// Builds the rule this entry describes.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the rule violates an invariant.
    pub fn to_rule(&self) -> Result<Rule> {
        let mut builder = Rule::builder(
            self.name.clone(),
            self.expression.clone(),
            self.operator,
            self.threshold,
        )
        .id(self.id.clone())
        .data_source(self.data_source.clone())
        .interval_secs(self.interval_secs)
        .for_duration_secs(self.for_secs)
        .keep_firing_for(std::time::Duration::from_secs(self.keep_firing_for_secs))
        .no_data_state(self.no_data_state)
        .exec_err_state(self.exec_err_state)
        .severity(self.severity)
        .labels(self.labels.clone())
        .enabled(self.enabled)
        .status(self.status);

        if let Some(recovery) = self.recovery_threshold {
            builder = builder.recovery_threshold(recovery);
        }
        for (key, value) in &self.annotations {
            builder = builder.annotation(key.clone(), value.clone());
        }
        builder.build()
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertdConfig {
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// JSON file mapping expressions to their current sample.
    pub samples_path: PathBuf,
    /// Rule definitions.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl AlertdConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AlertError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parses configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| AlertError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AlertError::Storage(e.to_string()))?;
            }
        }
        std::fs::write(path.as_ref(), json).map_err(|e| AlertError::Storage(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Config` naming the first offending entry.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        if self.samples_path.as_os_str().is_empty() {
            return Err(AlertError::Config("samples_path cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &self.rules {
            if entry.id.trim().is_empty() {
                return Err(AlertError::Config(format!(
                    "rule '{}' has an empty id",
                    entry.name
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(AlertError::Config(format!("duplicate rule id '{}'", entry.id)));
            }
            entry.to_rule()
                .map_err(|e| AlertError::Config(format!("rule '{}': {e}", entry.id)))?;
        }
        Ok(())
    }

    /// Builds every configured rule.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule is invalid.
    pub fn build_rules(&self) -> Result<Vec<Rule>> {
        self.rules.iter().map(RuleSpec::to_rule).collect()
    }

    /// Returns a starter configuration with one example rule.
    #[must_use]
    pub fn sample(samples_path: PathBuf) -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            samples_path,
            rules: vec![RuleSpec {
                id: "high-cpu".to_string(),
                name: "HighCPU".to_string(),
                expression: "avg(cpu_usage)".to_string(),
                data_source: "node-metrics".to_string(),
                operator: ComparisonOperator::GreaterThan,
                threshold: 80.0,
                recovery_threshold: Some(60.0),
                interval_secs: 30,
                for_secs: 60,
                keep_firing_for_secs: 120,
                no_data_state: StatePolicy::Ok,
                exec_err_state: StatePolicy::Alert,
                severity: AlertSeverity::Warning,
                labels: HashMap::from([("team".to_string(), "platform".to_string())]),
                annotations: HashMap::from([(
                    "summary".to_string(),
                    "CPU usage is above 80%".to_string(),
                )]),
                enabled: true,
                status: RuleStatus::Active,
            }],
        }
    }
}
