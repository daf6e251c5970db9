//! The evaluator seam.
//!
//! An [`Evaluator`] runs a rule's expression against its data source and
//! returns a single sample. Query languages and metric backends live behind
//! this trait; the scheduler only bounds each call with a deadline.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{AlertError, Result};
use crate::types::Rule;

/// Produces samples for rules.
///
/// `Ok(None)` means the query succeeded but returned no data.
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluates the rule's expression.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::EvaluatorUnavailable` if the backend cannot answer.
    fn evaluate(&self, rule: &Rule) -> impl Future<Output = Result<Option<f64>>> + Send;
}

/// One scripted answer of a [`FakeEvaluator`].
#[derive(Debug, Clone, PartialEq)]
pub enum FakeOutcome {
    /// Return this sample.
    Value(f64),
    /// Return no data.
    NoData,
    /// Fail with `EvaluatorUnavailable`.
    Fail(String),
    /// Sleep before returning no data; used to trip evaluation timeouts.
    Stall(Duration),
}

/// Scripted evaluator for tests and dry runs.
///
/// Each rule has a queue of outcomes. Outcomes are consumed in order and
/// the last one repeats. Rules without a script return no data.
#[derive(Debug, Default)]
pub struct FakeEvaluator {
    scripts: Mutex<HashMap<String, VecDeque<FakeOutcome>>>,
    calls: AtomicUsize,
}

impl FakeEvaluator {
    /// Creates an evaluator with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an outcome to a rule's script.
    pub fn push(&self, rule_id: &str, outcome: FakeOutcome) {
        self.scripts
            .lock()
            .entry(rule_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Appends a series of samples to a rule's script.
    pub fn push_values(&self, rule_id: &str, values: &[f64]) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(rule_id.to_string()).or_default();
        script.extend(values.iter().copied().map(FakeOutcome::Value));
    }

    /// Replaces a rule's script with a single repeating outcome.
    pub fn set(&self, rule_id: &str, outcome: FakeOutcome) {
        self.scripts
            .lock()
            .insert(rule_id.to_string(), VecDeque::from([outcome]));
    }

    /// Returns the number of evaluations performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, rule_id: &str) -> FakeOutcome {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(rule_id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(FakeOutcome::NoData),
            Some(script) => script.front().cloned().unwrap_or(FakeOutcome::NoData),
            None => FakeOutcome::NoData,
        }
    }
}

impl Evaluator for FakeEvaluator {
    async fn evaluate(&self, rule: &Rule) -> Result<Option<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_outcome(&rule.id) {
            FakeOutcome::Value(v) => Ok(Some(v)),
            FakeOutcome::NoData => Ok(None),
            FakeOutcome::Fail(reason) => Err(AlertError::EvaluatorUnavailable { reason }),
            FakeOutcome::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
        }
    }
}
