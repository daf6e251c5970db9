//! Core types for rule evaluation and the alert lifecycle.
//!
//! This module provides the data model shared by the scheduler, the
//! evaluation engine and the lifecycle manager:
//! - [`AlertSeverity`]: The severity level of an alert
//! - [`AlertStatus`]: The lifecycle status of an alert
//! - [`ComparisonOperator`]: Operators for comparing sampled values
//! - [`StatePolicy`]: What a no-data or evaluator-error outcome means
//! - [`Rule`]: A monitored condition and its evaluation bookkeeping
//! - [`Alert`]: An open or resolved alert instance
//! - [`AlertHistory`]: One audit row per state transition

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AlertError, Result};
use crate::fingerprint::Fingerprint;

/// Actor recorded on history rows written by the scheduler.
pub const SYSTEM_ACTOR: &str = "system";

/// Upper bound for any configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Converts a validated number of seconds into a chrono duration.
pub(crate) fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// The severity level of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alert, no action required.
    Info,
    /// Warning alert, should be investigated.
    #[default]
    Warning,
    /// Critical alert, requires immediate attention.
    Critical,
}

impl AlertSeverity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Returns the priority of this severity (higher = more urgent).
    #[must_use]
    pub const fn priority(&self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Warning => 2,
            Self::Critical => 3,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The lifecycle status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The condition breaches but has not yet held for the rule's `for` duration.
    Pending,
    /// The alert is actively firing.
    Firing,
    /// An operator has taken ownership of the alert.
    Acknowledged,
    /// The alert is muted until its silence expires.
    Silenced,
    /// The alert is closed. Terminal.
    Resolved,
}

impl AlertStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Acknowledged => "acknowledged",
            Self::Silenced => "silenced",
            Self::Resolved => "resolved",
        }
    }

    /// Returns true for every status except [`AlertStatus::Resolved`].
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative status of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// The rule is scheduled.
    #[default]
    Active,
    /// The rule is kept but never scheduled.
    Inactive,
    /// The rule is being authored and is not scheduled.
    Testing,
}

/// Comparison operators for rule thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Greater than (>).
    #[serde(rename = ">")]
    GreaterThan,
    /// Greater than or equal (>=).
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Less than (<).
    #[serde(rename = "<")]
    LessThan,
    /// Less than or equal (<=).
    #[serde(rename = "<=")]
    LessThanOrEqual,
    /// Equal (==).
    #[serde(rename = "==")]
    Equal,
    /// Not equal (!=).
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates the comparison between two values.
    #[must_use]
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::GreaterThan => left > right,
            Self::GreaterThanOrEqual => left >= right,
            Self::LessThan => left < right,
            Self::LessThanOrEqual => left <= right,
            Self::Equal => (left - right).abs() < f64::EPSILON,
            Self::NotEqual => (left - right).abs() >= f64::EPSILON,
        }
    }

    /// Returns `Some(true)` when breaching means "above", `Some(false)` when
    /// it means "below", and `None` for the equality operators.
    #[must_use]
    pub const fn breaches_upward(&self) -> Option<bool> {
        match self {
            Self::GreaterThan | Self::GreaterThanOrEqual => Some(true),
            Self::LessThan | Self::LessThanOrEqual => Some(false),
            Self::Equal | Self::NotEqual => None,
        }
    }

    /// Returns the operator as a string symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_symbol())
    }
}

/// How a no-data or evaluator-error outcome affects alert state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatePolicy {
    /// Treat the outcome as a healthy sample.
    Ok,
    /// Treat the outcome as a breach.
    Breach,
    /// Treat the outcome as a breach and annotate the alert with the cause.
    #[default]
    Alert,
}

/// Classification of a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The sample does not breach.
    Ok,
    /// The sample breaches.
    Breach,
    /// The evaluator returned no sample.
    NoData,
    /// The evaluator failed or timed out.
    Error,
}

impl Verdict {
    /// Returns the verdict as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Breach => "breach",
            Self::NoData => "no_data",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A monitored condition together with its evaluation bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for the rule.
    pub id: String,
    /// Human-readable name for the rule.
    pub name: String,
    /// Query handed to the evaluator. Opaque to this crate.
    pub expression: String,
    /// Data source the evaluator runs the expression against.
    #[serde(default)]
    pub data_source: String,
    /// Comparison applied between the sample and the thresholds.
    pub operator: ComparisonOperator,
    /// Threshold whose crossing is a breach.
    pub threshold: f64,
    /// Less strict bound a firing alert must cross to recover.
    #[serde(default)]
    pub recovery_threshold: Option<f64>,
    /// Seconds between evaluations.
    pub interval_secs: u64,
    /// How long a breach must hold before firing (in seconds).
    #[serde(default)]
    pub for_duration_secs: u64,
    /// How long a firing alert must read ok before resolving (in seconds).
    #[serde(default)]
    pub keep_firing_for_secs: u64,
    /// Effect of an evaluation that returned no sample.
    #[serde(default)]
    pub no_data_state: StatePolicy,
    /// Effect of an evaluator failure or timeout.
    #[serde(default)]
    pub exec_err_state: StatePolicy,
    /// The severity of alerts generated by this rule.
    #[serde(default)]
    pub severity: AlertSeverity,
    /// Labels attached to alerts; part of the fingerprint.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Annotations copied onto alerts.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Whether this rule is enabled.
    pub enabled: bool,
    /// Administrative status.
    #[serde(default)]
    pub status: RuleStatus,
    /// When the rule was last evaluated.
    #[serde(default)]
    pub last_eval_at: Option<DateTime<Utc>>,
    /// Outcome of the last evaluation.
    #[serde(default)]
    pub last_eval_result: Option<Verdict>,
    /// Error message of the last evaluation, if it failed.
    #[serde(default)]
    pub last_eval_error: Option<String>,
    /// Number of completed evaluations.
    #[serde(default)]
    pub eval_count: u64,
    /// Set when the rule failed validation at evaluation time.
    #[serde(default)]
    pub config_error: Option<String>,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Maximum allowed length for rule names.
    pub const MAX_NAME_LENGTH: usize = 256;

    /// Creates a new rule builder.
    pub fn builder(
        name: impl Into<String>,
        expression: impl Into<String>,
        operator: ComparisonOperator,
        threshold: f64,
    ) -> RuleBuilder {
        RuleBuilder::new(name, expression, operator, threshold)
    }

    /// Returns the evaluation interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the `for` duration.
    #[must_use]
    pub const fn for_duration(&self) -> Duration {
        Duration::from_secs(self.for_duration_secs)
    }

    /// Returns the keep-firing duration.
    #[must_use]
    pub const fn keep_firing_for(&self) -> Duration {
        Duration::from_secs(self.keep_firing_for_secs)
    }

    /// Returns the bound a firing alert must cross to recover.
    ///
    /// Without a configured recovery threshold this is the breach threshold
    /// itself, so recovery is the plain negation of the breach comparison.
    #[must_use]
    pub fn recovery_bound(&self) -> f64 {
        self.recovery_threshold.unwrap_or(self.threshold)
    }

    /// Returns true if the scheduler should consider this rule at all.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.enabled
            && self.status == RuleStatus::Active
            && self.deleted_at.is_none()
            && self.config_error.is_none()
    }

    /// Returns true if the rule is schedulable and its interval has elapsed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_schedulable() {
            return false;
        }
        match self.last_eval_at {
            None => true,
            Some(last) => last + chrono_secs(self.interval_secs) <= now,
        }
    }

    /// Checks the rule invariants.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(AlertError::InvalidRule { reason });

        if self.name.is_empty() {
            return invalid("rule name cannot be empty".to_string());
        }
        if self.name.len() > Self::MAX_NAME_LENGTH {
            return invalid(format!(
                "rule name exceeds maximum length of {} characters",
                Self::MAX_NAME_LENGTH
            ));
        }
        if self.expression.trim().is_empty() {
            return invalid("expression cannot be empty".to_string());
        }
        if self.interval_secs == 0 {
            return invalid("evaluation interval must be positive".to_string());
        }
        for (field, secs) in [
            ("evaluation interval", self.interval_secs),
            ("for duration", self.for_duration_secs),
            ("keep-firing duration", self.keep_firing_for_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return invalid(format!("{field} exceeds {MAX_DURATION_SECS} seconds"));
            }
        }
        if !self.threshold.is_finite() {
            return invalid("threshold must be a finite number".to_string());
        }

        if let Some(recovery) = self.recovery_threshold {
            if !recovery.is_finite() {
                return invalid("recovery threshold must be a finite number".to_string());
            }
            match self.operator.breaches_upward() {
                None => {
                    return invalid(format!(
                        "recovery threshold is not supported with operator {}",
                        self.operator
                    ));
                }
                Some(true) if recovery >= self.threshold => {
                    return invalid(format!(
                        "recovery threshold {recovery} must be below threshold {}",
                        self.threshold
                    ));
                }
                Some(false) if recovery <= self.threshold => {
                    return invalid(format!(
                        "recovery threshold {recovery} must be above threshold {}",
                        self.threshold
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Builder for creating [`Rule`] instances.
#[derive(Debug)]
pub struct RuleBuilder {
    id: Option<String>,
    name: String,
    expression: String,
    data_source: String,
    operator: ComparisonOperator,
    threshold: f64,
    recovery_threshold: Option<f64>,
    interval_secs: u64,
    for_duration_secs: u64,
    keep_firing_for_secs: u64,
    no_data_state: StatePolicy,
    exec_err_state: StatePolicy,
    severity: AlertSeverity,
    labels: HashMap<String, String>,
    annotations: HashMap<String, String>,
    enabled: bool,
    status: RuleStatus,
}

impl RuleBuilder {
    /// Default evaluation interval in seconds.
    pub const DEFAULT_INTERVAL_SECS: u64 = 60;

    fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        operator: ComparisonOperator,
        threshold: f64,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            expression: expression.into(),
            data_source: String::new(),
            operator,
            threshold,
            recovery_threshold: None,
            interval_secs: Self::DEFAULT_INTERVAL_SECS,
            for_duration_secs: 0,
            keep_firing_for_secs: 0,
            no_data_state: StatePolicy::default(),
            exec_err_state: StatePolicy::default(),
            severity: AlertSeverity::Warning,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            enabled: true,
            status: RuleStatus::Active,
        }
    }

    /// Uses a fixed ID instead of a generated one.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the data source.
    #[must_use]
    pub fn data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    /// Sets the recovery threshold used for hysteresis.
    #[must_use]
    pub const fn recovery_threshold(mut self, recovery: f64) -> Self {
        self.recovery_threshold = Some(recovery);
        self
    }

    /// Sets the evaluation interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval_secs = interval.as_secs();
        self
    }

    /// Sets the evaluation interval in seconds.
    #[must_use]
    pub const fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    /// Sets the duration the condition must hold before firing.
    #[must_use]
    pub const fn for_duration(mut self, duration: Duration) -> Self {
        self.for_duration_secs = duration.as_secs();
        self
    }

    /// Sets the `for` duration in seconds.
    #[must_use]
    pub const fn for_duration_secs(mut self, secs: u64) -> Self {
        self.for_duration_secs = secs;
        self
    }

    /// Sets how long the condition must read ok before a firing alert resolves.
    #[must_use]
    pub const fn keep_firing_for(mut self, duration: Duration) -> Self {
        self.keep_firing_for_secs = duration.as_secs();
        self
    }

    /// Sets the no-data policy.
    #[must_use]
    pub const fn no_data_state(mut self, policy: StatePolicy) -> Self {
        self.no_data_state = policy;
        self
    }

    /// Sets the evaluator-error policy.
    #[must_use]
    pub const fn exec_err_state(mut self, policy: StatePolicy) -> Self {
        self.exec_err_state = policy;
        self
    }

    /// Sets the severity level.
    #[must_use]
    pub const fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Adds a label to the rule.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds multiple labels to the rule.
    #[must_use]
    pub fn labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Adds an annotation to the rule.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets whether the rule is enabled.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the administrative status.
    #[must_use]
    pub const fn status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    /// Builds the [`Rule`].
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the rule violates an invariant
    /// (see [`Rule::validate`]).
    pub fn build(self) -> Result<Rule> {
        let rule = Rule {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            expression: self.expression,
            data_source: self.data_source,
            operator: self.operator,
            threshold: self.threshold,
            recovery_threshold: self.recovery_threshold,
            interval_secs: self.interval_secs,
            for_duration_secs: self.for_duration_secs,
            keep_firing_for_secs: self.keep_firing_for_secs,
            no_data_state: self.no_data_state,
            exec_err_state: self.exec_err_state,
            severity: self.severity,
            labels: self.labels,
            annotations: self.annotations,
            enabled: self.enabled,
            status: self.status,
            last_eval_at: None,
            last_eval_result: None,
            last_eval_error: None,
            eval_count: 0,
            config_error: None,
            deleted_at: None,
        };
        rule.validate()?;
        Ok(rule)
    }
}

/// An open or resolved alert instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier for this alert instance.
    pub id: String,
    /// The rule that raised this alert; `None` for manually raised alerts.
    pub rule_id: Option<String>,
    /// The rule name, or the title of a manual alert.
    pub rule_name: String,
    /// Deduplication key.
    pub fingerprint: Fingerprint,
    /// The severity of the alert.
    pub severity: AlertSeverity,
    /// The current lifecycle status.
    pub status: AlertStatus,
    /// The most recent sampled value; `None` until a sample is seen.
    pub value: Option<f64>,
    /// The rule threshold when the alert was created.
    pub threshold: Option<f64>,
    /// When the alert was opened.
    pub starts_at: DateTime<Utc>,
    /// When the alert first fired.
    pub fired_at: Option<DateTime<Utc>>,
    /// When the alert was resolved.
    pub ends_at: Option<DateTime<Utc>>,
    /// Timestamp of the last applied verdict.
    pub last_eval_at: DateTime<Utc>,
    /// Number of verdicts applied to this alert.
    pub eval_count: u64,
    /// Keep-firing window of the owning rule, refreshed on every verdict.
    #[serde(default)]
    pub keep_firing_for_secs: u64,
    /// Timestamp of the last breaching verdict.
    pub last_breach_at: Option<DateTime<Utc>>,
    /// Whether the last applied verdict was breaching.
    pub breaching: bool,
    /// Active silence, if any.
    pub silence_id: Option<String>,
    /// When the active silence ends.
    pub silence_expiry: Option<DateTime<Utc>>,
    /// Who acknowledged the alert.
    pub acknowledged_by: Option<String>,
    /// When the alert was acknowledged.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Who resolved the alert (`system` for automatic resolution).
    pub resolved_by: Option<String>,
    /// Labels attached to the alert.
    pub labels: HashMap<String, String>,
    /// Annotations providing more context.
    pub annotations: HashMap<String, String>,
    /// Optimistic concurrency version, bumped by every stored write.
    pub version: u64,
}

impl Alert {
    /// Opens a new alert for a rule.
    #[must_use]
    pub fn from_rule(
        rule: &Rule,
        fingerprint: Fingerprint,
        status: AlertStatus,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut labels = rule.labels.clone();
        labels.insert("alertname".to_string(), rule.name.clone());

        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: Some(rule.id.clone()),
            rule_name: rule.name.clone(),
            fingerprint,
            severity: rule.severity,
            status,
            value,
            threshold: Some(rule.threshold),
            starts_at: now,
            fired_at: (status == AlertStatus::Firing).then_some(now),
            ends_at: None,
            last_eval_at: now,
            eval_count: 1,
            keep_firing_for_secs: rule.keep_firing_for_secs,
            last_breach_at: Some(now),
            breaching: true,
            silence_id: None,
            silence_expiry: None,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            labels,
            annotations: rule.annotations.clone(),
            version: 0,
        }
    }

    /// Opens a manually raised alert that no rule owns.
    #[must_use]
    pub fn manual(
        title: impl Into<String>,
        fingerprint: Fingerprint,
        severity: AlertSeverity,
        labels: HashMap<String, String>,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: None,
            rule_name: title.into(),
            fingerprint,
            severity,
            status: AlertStatus::Firing,
            value,
            threshold: None,
            starts_at: now,
            fired_at: Some(now),
            ends_at: None,
            last_eval_at: now,
            eval_count: 0,
            keep_firing_for_secs: 0,
            last_breach_at: Some(now),
            breaching: true,
            silence_id: None,
            silence_expiry: None,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            labels,
            annotations: HashMap::new(),
            version: 0,
        }
    }

    /// Returns true if the alert is not resolved.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Returns true if the alert is open and has fired at least once.
    ///
    /// An alert acknowledged or silenced while still pending has not fired;
    /// hysteresis and keep-firing only apply once it has.
    #[must_use]
    pub const fn has_fired(&self) -> bool {
        self.is_open() && self.fired_at.is_some()
    }
}

/// The kind of change an [`AlertHistory`] row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// The alert was opened.
    Created,
    /// The alert was promoted from pending to firing, or re-fired.
    Fired,
    /// A verdict changed the recorded value without a status change.
    Evaluated,
    /// An operator acknowledged the alert.
    Acknowledged,
    /// An operator silenced the alert.
    Silenced,
    /// An operator lifted the silence.
    Unsilenced,
    /// The silence ran out.
    SilenceExpired,
    /// The alert was resolved.
    Resolved,
}

impl HistoryAction {
    /// Returns the action as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Fired => "fired",
            Self::Evaluated => "evaluated",
            Self::Acknowledged => "acknowledged",
            Self::Silenced => "silenced",
            Self::Unsilenced => "unsilenced",
            Self::SilenceExpired => "silence_expired",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only audit row for one alert state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistory {
    /// Unique identifier for the row.
    pub id: String,
    /// The alert the row belongs to.
    pub alert_id: String,
    /// What happened.
    pub action: HistoryAction,
    /// Operator identity, or [`SYSTEM_ACTOR`].
    pub actor: String,
    /// Status before the change; `None` on creation.
    pub old_status: Option<AlertStatus>,
    /// Status after the change.
    pub new_status: AlertStatus,
    /// Value before the change.
    pub old_value: Option<f64>,
    /// Value after the change.
    pub new_value: Option<f64>,
    /// Operator comment.
    pub comment: Option<String>,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

impl AlertHistory {
    /// Creates a history row for a status change.
    #[must_use]
    pub fn new(
        alert: &Alert,
        action: HistoryAction,
        actor: impl Into<String>,
        old_status: Option<AlertStatus>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_id: alert.id.clone(),
            action,
            actor: actor.into(),
            old_status,
            new_status: alert.status,
            old_value: None,
            new_value: alert.value,
            comment: None,
            at,
        }
    }

    /// Records the value before the change.
    #[must_use]
    pub const fn with_old_value(mut self, value: Option<f64>) -> Self {
        self.old_value = value;
        self
    }

    /// Attaches an operator comment.
    #[must_use]
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_rule() -> RuleBuilder {
        Rule::builder("HighCPU", "avg(cpu_usage)", ComparisonOperator::GreaterThan, 80.0)
    }

    mod severity_tests {
        use super::*;

        #[test]
        fn severity_priority() {
            assert!(AlertSeverity::Info.priority() < AlertSeverity::Warning.priority());
            assert!(AlertSeverity::Warning.priority() < AlertSeverity::Critical.priority());
        }

        #[test]
        fn severity_default() {
            assert_eq!(AlertSeverity::default(), AlertSeverity::Warning);
        }
    }

    mod status_tests {
        use super::*;

        #[test]
        fn only_resolved_is_closed() {
            assert!(AlertStatus::Pending.is_open());
            assert!(AlertStatus::Firing.is_open());
            assert!(AlertStatus::Acknowledged.is_open());
            assert!(AlertStatus::Silenced.is_open());
            assert!(!AlertStatus::Resolved.is_open());
        }

        #[test]
        fn status_serializes_lowercase() {
            let json = serde_json::to_string(&AlertStatus::Acknowledged).unwrap();
            assert_eq!(json, "\"acknowledged\"");
        }
    }

    mod operator_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(ComparisonOperator::GreaterThan, 10.0, 5.0, true ; "gt above")]
        #[test_case(ComparisonOperator::GreaterThan, 5.0, 5.0, false ; "gt equal")]
        #[test_case(ComparisonOperator::GreaterThanOrEqual, 5.0, 5.0, true ; "ge equal")]
        #[test_case(ComparisonOperator::LessThan, 4.0, 5.0, true ; "lt below")]
        #[test_case(ComparisonOperator::LessThanOrEqual, 6.0, 5.0, false ; "le above")]
        #[test_case(ComparisonOperator::Equal, 5.0, 5.0, true ; "eq equal")]
        #[test_case(ComparisonOperator::NotEqual, 5.0, 5.0, false ; "ne equal")]
        fn operator_evaluate(op: ComparisonOperator, left: f64, right: f64, expected: bool) {
            assert_eq!(op.evaluate(left, right), expected);
        }

        #[test]
        fn operator_direction() {
            assert_eq!(ComparisonOperator::GreaterThan.breaches_upward(), Some(true));
            assert_eq!(ComparisonOperator::LessThanOrEqual.breaches_upward(), Some(false));
            assert_eq!(ComparisonOperator::NotEqual.breaches_upward(), None);
        }

        #[test]
        fn operator_serializes_as_symbol() {
            let json = serde_json::to_string(&ComparisonOperator::LessThanOrEqual).unwrap();
            assert_eq!(json, "\"<=\"");
        }
    }

    mod rule_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn create_rule_with_builder() {
            let rule = cpu_rule()
                .id("rule-1")
                .for_duration_secs(60)
                .keep_firing_for(Duration::from_secs(120))
                .severity(AlertSeverity::Critical)
                .label("team", "platform")
                .annotation("summary", "CPU is hot")
                .build()
                .unwrap();

            assert_eq!(rule.id, "rule-1");
            assert_eq!(rule.for_duration(), Duration::from_secs(60));
            assert_eq!(rule.keep_firing_for(), Duration::from_secs(120));
            assert_eq!(rule.interval(), Duration::from_secs(60));
            assert_eq!(rule.no_data_state, StatePolicy::Alert);
            assert_eq!(rule.labels.get("team"), Some(&"platform".to_string()));
            assert!(rule.enabled);
            assert!(rule.last_eval_at.is_none());
        }

        #[test]
        fn zero_interval_is_rejected() {
            let err = cpu_rule().interval_secs(0).build().unwrap_err();
            match err {
                AlertError::InvalidRule { reason } => assert!(reason.contains("interval")),
                other => panic!("expected InvalidRule, got {other:?}"),
            }
        }

        #[test]
        fn empty_name_is_rejected() {
            let rule = Rule::builder("", "up", ComparisonOperator::LessThan, 1.0).build();
            assert!(matches!(rule, Err(AlertError::InvalidRule { .. })));
        }

        #[test]
        fn empty_expression_is_rejected() {
            let rule = Rule::builder("Down", "  ", ComparisonOperator::LessThan, 1.0).build();
            assert!(matches!(rule, Err(AlertError::InvalidRule { .. })));
        }

        #[test_case(ComparisonOperator::GreaterThan, 80.0, 60.0, true ; "upward recovery below")]
        #[test_case(ComparisonOperator::GreaterThan, 80.0, 80.0, false ; "upward recovery equal")]
        #[test_case(ComparisonOperator::GreaterThan, 80.0, 90.0, false ; "upward recovery above")]
        #[test_case(ComparisonOperator::LessThan, 10.0, 20.0, true ; "downward recovery above")]
        #[test_case(ComparisonOperator::LessThanOrEqual, 10.0, 5.0, false ; "downward recovery below")]
        #[test_case(ComparisonOperator::Equal, 10.0, 5.0, false ; "equality has no direction")]
        fn recovery_threshold_direction(
            op: ComparisonOperator,
            threshold: f64,
            recovery: f64,
            valid: bool,
        ) {
            let rule = Rule::builder("r", "q", op, threshold)
                .recovery_threshold(recovery)
                .build();
            assert_eq!(rule.is_ok(), valid);
        }

        #[test]
        fn recovery_bound_defaults_to_threshold() {
            let rule = cpu_rule().build().unwrap();
            assert!((rule.recovery_bound() - 80.0).abs() < f64::EPSILON);

            let rule = cpu_rule().recovery_threshold(60.0).build().unwrap();
            assert!((rule.recovery_bound() - 60.0).abs() < f64::EPSILON);
        }

        #[test]
        fn never_evaluated_rule_is_due() {
            let rule = cpu_rule().build().unwrap();
            assert!(rule.is_due(Utc::now()));
        }

        #[test]
        fn rule_due_after_interval() {
            let now = Utc::now();
            let mut rule = cpu_rule().interval_secs(30).build().unwrap();
            rule.last_eval_at = Some(now - chrono::Duration::seconds(29));
            assert!(!rule.is_due(now));
            rule.last_eval_at = Some(now - chrono::Duration::seconds(30));
            assert!(rule.is_due(now));
        }

        #[test]
        fn inactive_disabled_flagged_or_deleted_rules_are_not_due() {
            let now = Utc::now();
            let base = cpu_rule().build().unwrap();

            let mut disabled = base.clone();
            disabled.enabled = false;
            let mut testing = base.clone();
            testing.status = RuleStatus::Testing;
            let mut flagged = base.clone();
            flagged.config_error = Some("bad".to_string());
            let mut deleted = base;
            deleted.deleted_at = Some(now);

            for rule in [disabled, testing, flagged, deleted] {
                assert!(!rule.is_due(now));
            }
        }

        #[test]
        fn rule_deserializes_with_defaults() {
            let json = r#"{
                "id": "r1",
                "name": "DiskFull",
                "expression": "disk_used_percent",
                "operator": ">=",
                "threshold": 95.0,
                "interval_secs": 30,
                "enabled": true
            }"#;
            let rule: Rule = serde_json::from_str(json).unwrap();
            assert_eq!(rule.operator, ComparisonOperator::GreaterThanOrEqual);
            assert_eq!(rule.status, RuleStatus::Active);
            assert_eq!(rule.exec_err_state, StatePolicy::Alert);
            assert!(rule.recovery_threshold.is_none());
            assert!(rule.validate().is_ok());
        }
    }

    mod alert_tests {
        use super::*;

        #[test]
        fn alert_from_rule_snapshots_threshold() {
            let rule = cpu_rule().label("host", "web-1").build().unwrap();
            let fp = Fingerprint::for_rule(&rule);
            let now = Utc::now();
            let alert = Alert::from_rule(&rule, fp.clone(), AlertStatus::Firing, Some(85.0), now);

            assert_eq!(alert.rule_id.as_deref(), Some(rule.id.as_str()));
            assert_eq!(alert.fingerprint, fp);
            assert_eq!(alert.threshold, Some(80.0));
            assert_eq!(alert.value, Some(85.0));
            assert_eq!(alert.fired_at, Some(now));
            assert_eq!(alert.labels.get("alertname"), Some(&"HighCPU".to_string()));
            assert_eq!(alert.version, 0);
            assert!(alert.is_open());
        }

        #[test]
        fn pending_alert_has_not_fired() {
            let rule = cpu_rule().for_duration_secs(60).build().unwrap();
            let alert = Alert::from_rule(
                &rule,
                Fingerprint::for_rule(&rule),
                AlertStatus::Pending,
                Some(85.0),
                Utc::now(),
            );
            assert!(alert.fired_at.is_none());
            assert!(!alert.has_fired());
        }

        #[test]
        fn fired_is_tracked_by_fired_at_not_status() {
            let rule = cpu_rule().for_duration_secs(60).build().unwrap();
            let now = Utc::now();
            let mut alert = Alert::from_rule(
                &rule,
                Fingerprint::for_rule(&rule),
                AlertStatus::Pending,
                Some(85.0),
                now,
            );

            alert.status = AlertStatus::Acknowledged;
            assert!(!alert.has_fired());

            alert.fired_at = Some(now);
            assert!(alert.has_fired());

            alert.status = AlertStatus::Resolved;
            assert!(!alert.has_fired());
        }

        #[test]
        fn history_row_captures_transition() {
            let rule = cpu_rule().build().unwrap();
            let now = Utc::now();
            let alert = Alert::from_rule(
                &rule,
                Fingerprint::for_rule(&rule),
                AlertStatus::Firing,
                Some(85.0),
                now,
            );
            let row = AlertHistory::new(
                &alert,
                HistoryAction::Fired,
                SYSTEM_ACTOR,
                Some(AlertStatus::Pending),
                now,
            )
            .with_old_value(Some(82.0))
            .with_comment(Some("promoted".to_string()));

            assert_eq!(row.alert_id, alert.id);
            assert_eq!(row.new_status, AlertStatus::Firing);
            assert_eq!(row.old_status, Some(AlertStatus::Pending));
            assert_eq!(row.old_value, Some(82.0));
            assert_eq!(row.actor, "system");
        }
    }
}
