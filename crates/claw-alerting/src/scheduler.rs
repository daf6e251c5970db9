//! Rule evaluation scheduler.
//!
//! Each tick the [`Scheduler`]:
//! 1. expires silences whose time is up,
//! 2. fetches the rules whose interval has elapsed,
//! 3. evaluates each on a bounded worker pool with a per-evaluation deadline,
//! 4. hands the verdict to the [`LifecycleManager`] and records the evaluation.
//!
//! A rule is never evaluated twice at once: the [`InFlightRegistry`] hands out
//! one [`InFlightGuard`] per rule and a rule whose guard is held is skipped.
//! Nothing a single rule does can abort the tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::{self, SampleOutcome};
use crate::error::{AlertError, Result};
use crate::evaluator::Evaluator;
use crate::fingerprint::Fingerprint;
use crate::lifecycle::{LifecycleManager, TransitionOutcome};
use crate::store::{AlertStore, EvaluationRecord, RuleStore};
use crate::types::{AlertStatus, Rule, Verdict};

/// Set of rules currently being evaluated.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    rules: Mutex<HashSet<String>>,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks a rule as in flight.
    ///
    /// Returns `None` if the rule is already in flight. The marker is cleared
    /// when the guard is dropped.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, rule_id: &str) -> Option<InFlightGuard> {
        if !self.rules.lock().insert(rule_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            rule_id: rule_id.to_string(),
        })
    }

    /// Returns true if the rule is being evaluated.
    #[must_use]
    pub fn is_in_flight(&self, rule_id: &str) -> bool {
        self.rules.lock().contains(rule_id)
    }

    /// Returns the number of rules in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }
}

/// RAII marker for one in-flight evaluation.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    rule_id: String,
}

impl InFlightGuard {
    /// Returns the rule this guard covers.
    #[must_use]
    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.rules.lock().remove(&self.rule_id);
    }
}

/// The result of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Rules that were due.
    pub rules_due: usize,
    /// Rules that were evaluated.
    pub rules_evaluated: usize,
    /// Evaluations whose evaluator failed or timed out.
    pub rules_errored: usize,
    /// Due rules skipped because an earlier evaluation was still running.
    pub rules_skipped: usize,
    /// Rules flagged as misconfigured.
    pub rules_invalid: usize,
    /// Verdicts that could not be written (conflicts or storage errors).
    pub write_failures: usize,
    /// Alerts opened this tick.
    pub alerts_created: Vec<String>,
    /// Alerts that started firing this tick.
    pub alerts_fired: Vec<String>,
    /// Alerts resolved this tick.
    pub alerts_resolved: Vec<String>,
    /// Silences that ran out this tick.
    pub silences_expired: usize,
}

impl TickReport {
    fn record(&mut self, evaluation: RuleEvaluation) {
        self.rules_evaluated += 1;
        if evaluation.verdict == Verdict::Error {
            self.rules_errored += 1;
        }
        match evaluation.transition {
            Some(outcome) => {
                if let Some(alert) = outcome.alert() {
                    if outcome.is_created() {
                        self.alerts_created.push(alert.id.clone());
                    }
                    if outcome.is_fired() {
                        self.alerts_fired.push(alert.id.clone());
                    }
                    if outcome.is_resolved() {
                        self.alerts_resolved.push(alert.id.clone());
                    }
                }
            }
            None => self.write_failures += 1,
        }
    }
}

/// What happened to one rule inside a tick.
#[derive(Debug)]
struct RuleEvaluation {
    verdict: Verdict,
    /// `None` if the verdict could not be applied.
    transition: Option<TransitionOutcome>,
}

/// Periodically evaluates due rules and drives the alert lifecycle.
pub struct Scheduler<R, A, E> {
    config: SchedulerConfig,
    rules: Arc<R>,
    lifecycle: Arc<LifecycleManager<A>>,
    evaluator: Arc<E>,
    in_flight: Arc<InFlightRegistry>,
    permits: Arc<Semaphore>,
}

impl<R, A, E> std::fmt::Debug for Scheduler<R, A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl<R, A, E> Scheduler<R, A, E>
where
    R: RuleStore,
    A: AlertStore,
    E: Evaluator,
{
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Config` if the configuration is invalid.
    pub fn new(
        config: SchedulerConfig,
        rules: Arc<R>,
        lifecycle: Arc<LifecycleManager<A>>,
        evaluator: Arc<E>,
        in_flight: Arc<InFlightRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_evaluations));
        Ok(Self {
            config,
            rules,
            lifecycle,
            evaluator,
            in_flight,
            permits,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager<A>> {
        &self.lifecycle
    }

    /// Returns the IDs of rules due at `now` that are not already in flight,
    /// in dispatch order.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .rules
            .fetch_due(now)?
            .into_iter()
            .filter(|r| !self.in_flight.is_in_flight(&r.id))
            .map(|r| r.id)
            .collect())
    }

    /// Runs one evaluation cycle and waits for every dispatched evaluation.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.lifecycle.expire_silences(now) {
            Ok(expired) => {
                report.silences_expired = expired.len();
                for alert in expired {
                    match alert.status {
                        AlertStatus::Firing => report.alerts_fired.push(alert.id),
                        AlertStatus::Resolved => report.alerts_resolved.push(alert.id),
                        _ => {}
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to scan for expired silences"),
        }

        let rules = match self.rules.fetch_due(now) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "failed to fetch due rules");
                return report;
            }
        };
        report.rules_due = rules.len();

        let mut tasks = JoinSet::new();
        for rule in rules {
            let Some(guard) = self.in_flight.try_acquire(&rule.id) else {
                debug!(rule_id = %rule.id, "rule still in flight, skipping");
                report.rules_skipped += 1;
                continue;
            };

            if let Err(e) = rule.validate() {
                warn!(rule_id = %rule.id, error = %e, "flagging invalid rule");
                if let Err(e) = self.rules.flag_invalid(&rule.id, &e.to_string()) {
                    warn!(rule_id = %rule.id, error = %e, "failed to flag invalid rule");
                }
                report.rules_invalid += 1;
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                warn!("worker pool closed");
                break;
            };

            let rules = Arc::clone(&self.rules);
            let lifecycle = Arc::clone(&self.lifecycle);
            let evaluator = Arc::clone(&self.evaluator);
            let timeout = self.config.evaluation_timeout();
            tasks.spawn(async move {
                let evaluation = evaluate_rule(&*rules, &*lifecycle, &*evaluator, &rule, timeout, now).await;
                drop(permit);
                drop(guard);
                evaluation
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(evaluation) => report.record(evaluation),
                Err(e) => {
                    warn!(error = %e, "evaluation task failed");
                    report.write_failures += 1;
                }
            }
        }

        if !report.alerts_created.is_empty() || !report.alerts_resolved.is_empty() {
            info!(
                evaluated = report.rules_evaluated,
                created = report.alerts_created.len(),
                fired = report.alerts_fired.len(),
                resolved = report.alerts_resolved.len(),
                "tick complete"
            );
        } else {
            debug!(evaluated = report.rules_evaluated, errored = report.rules_errored, "tick complete");
        }
        report
    }

    /// Ticks every `tick_interval` until `shutdown` turns true.
    ///
    /// A tick that is running when shutdown arrives is allowed to finish;
    /// its evaluations are bounded by the evaluation timeout.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            max_concurrent = self.config.max_concurrent_evaluations,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn evaluate_rule<R, A, E>(
    rules: &R,
    lifecycle: &LifecycleManager<A>,
    evaluator: &E,
    rule: &Rule,
    timeout: Duration,
    now: DateTime<Utc>,
) -> RuleEvaluation
where
    R: RuleStore,
    A: AlertStore,
    E: Evaluator,
{
    let result = match tokio::time::timeout(timeout, evaluator.evaluate(rule)).await {
        Ok(result) => result,
        Err(_) => Err(AlertError::EvaluatorTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    };
    let outcome = SampleOutcome::from_result(result);

    let current = lifecycle.open_alert(&Fingerprint::for_rule(rule));
    let verdict = engine::evaluate(rule, &outcome, current.as_ref().ok().and_then(Option::as_ref), now);
    let transition = match current {
        Ok(_) => match lifecycle.apply(rule, &verdict) {
            Ok(transition) => Some(transition),
            Err(e) if e.is_conflict() => {
                warn!(rule_id = %rule.id, error = %e, "alert write lost to a concurrent change, skipping");
                None
            }
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "failed to apply verdict");
                None
            }
        },
        Err(e) => {
            warn!(rule_id = %rule.id, error = %e, "failed to read alert state");
            None
        }
    };
    debug!(rule_id = %rule.id, verdict = %verdict.verdict, breaching = verdict.breaching, "evaluated rule");

    // Advances even on failure so a broken rule does not starve the schedule.
    let record = EvaluationRecord {
        at: now,
        result: verdict.verdict,
        error: verdict.error,
    };
    if let Err(e) = rules.record_evaluation(&rule.id, record) {
        warn!(rule_id = %rule.id, error = %e, "failed to record evaluation");
    }

    RuleEvaluation {
        verdict: verdict.verdict,
        transition,
    }
}
