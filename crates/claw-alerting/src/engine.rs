//! Evaluation engine: turns one sample into a verdict.
//!
//! The engine is a pure function of the rule, the evaluator outcome and the
//! rule's currently open alert. It applies, in order:
//!
//! 1. the exec-error policy when the evaluator failed or timed out,
//! 2. the no-data policy when the evaluator returned nothing,
//! 3. the threshold comparison,
//! 4. hysteresis: once an alert has fired, only crossing the recovery bound
//!    counts as recovery. An alert acknowledged or silenced before it fired
//!    gets none.

use chrono::{DateTime, Utc};

use crate::error::{AlertError, Result};
use crate::types::{Alert, Rule, StatePolicy, Verdict};

/// Annotation key set on alerts kept open by an evaluator failure.
pub const ANNOTATION_EVALUATION_ERROR: &str = "evaluation_error";

/// Annotation key set on alerts kept open by missing data.
pub const ANNOTATION_NO_DATA: &str = "no_data";

/// What the evaluator produced for one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// A sample.
    Value(f64),
    /// The query returned no sample.
    NoData,
    /// The evaluator failed or exceeded its deadline.
    Failed(String),
}

impl SampleOutcome {
    /// Converts an evaluator result into an outcome.
    #[must_use]
    pub fn from_result(result: Result<Option<f64>>) -> Self {
        match result {
            Ok(Some(value)) if value.is_finite() => Self::Value(value),
            Ok(Some(value)) => Self::Failed(format!("evaluator returned non-finite sample {value}")),
            Ok(None) => Self::NoData,
            Err(AlertError::EvaluatorUnavailable { reason }) => Self::Failed(reason),
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// The engine's classification of one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationVerdict {
    /// Raw classification before policy substitution.
    pub verdict: Verdict,
    /// Whether the lifecycle should treat this evaluation as a breach.
    pub breaching: bool,
    /// The sampled value, if there was one.
    pub value: Option<f64>,
    /// When the sample was taken.
    pub evaluated_at: DateTime<Utc>,
    /// Annotation to attach to the alert, as `(key, text)`.
    pub annotation: Option<(&'static str, String)>,
    /// Evaluator error message, if the evaluation failed.
    pub error: Option<String>,
}

impl EvaluationVerdict {
    /// Builds a verdict for a plain sample with no policy involved.
    #[must_use]
    pub const fn sample(verdict: Verdict, value: f64, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            verdict,
            breaching: matches!(verdict, Verdict::Breach),
            value: Some(value),
            evaluated_at,
            annotation: None,
            error: None,
        }
    }
}

/// Classifies one evaluator outcome for `rule`.
///
/// `current` is the rule's open alert, if any; hysteresis only applies once
/// that alert has fired.
#[must_use]
pub fn evaluate(
    rule: &Rule,
    outcome: &SampleOutcome,
    current: Option<&Alert>,
    evaluated_at: DateTime<Utc>,
) -> EvaluationVerdict {
    match outcome {
        SampleOutcome::Failed(reason) => {
            let (breaching, annotation) = apply_policy(
                rule.exec_err_state,
                ANNOTATION_EVALUATION_ERROR,
                format!("evaluation error: {reason}"),
            );
            EvaluationVerdict {
                verdict: Verdict::Error,
                breaching,
                value: None,
                evaluated_at,
                annotation,
                error: Some(reason.clone()),
            }
        }
        SampleOutcome::NoData => {
            let (breaching, annotation) = apply_policy(
                rule.no_data_state,
                ANNOTATION_NO_DATA,
                "evaluation returned no data".to_string(),
            );
            EvaluationVerdict {
                verdict: Verdict::NoData,
                breaching,
                value: None,
                evaluated_at,
                annotation,
                error: None,
            }
        }
        SampleOutcome::Value(value) => {
            let verdict = if is_breach(rule, *value, current) {
                Verdict::Breach
            } else {
                Verdict::Ok
            };
            EvaluationVerdict::sample(verdict, *value, evaluated_at)
        }
    }
}

/// Compares a sample against the rule, honoring hysteresis for fired alerts.
#[must_use]
pub fn is_breach(rule: &Rule, value: f64, current: Option<&Alert>) -> bool {
    if rule.operator.evaluate(value, rule.threshold) {
        return true;
    }
    // A fired alert stays in breach until the sample crosses the recovery bound.
    current.is_some_and(Alert::has_fired) && rule.operator.evaluate(value, rule.recovery_bound())
}

fn apply_policy(
    policy: StatePolicy,
    key: &'static str,
    text: String,
) -> (bool, Option<(&'static str, String)>) {
    match policy {
        StatePolicy::Ok => (false, None),
        StatePolicy::Breach => (true, None),
        StatePolicy::Alert => (true, Some((key, text))),
    }
}
