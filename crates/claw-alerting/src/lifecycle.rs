//! Alert lifecycle manager.
//!
//! This module provides the [`LifecycleManager`], the state machine that turns
//! evaluation verdicts into alert creation and transitions, and that exposes
//! the operator actions:
//! - acknowledge, resolve, silence and unsilence an open alert
//! - raise a manual alert that no rule owns
//! - expire silences, driven from the scheduler tick
//!
//! Every status change is written together with one history row through a
//! versioned [`AlertWrite`]. A write that loses the version race is retried
//! with fresh state; the transition is derived from the persisted status and
//! the verdict, so replaying it is harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::engine::{ANNOTATION_EVALUATION_ERROR, ANNOTATION_NO_DATA, EvaluationVerdict};
use crate::error::{AlertError, Result};
use crate::fingerprint::{Claim, DedupIndex, Fingerprint};
use crate::store::{AlertStore, AlertWrite};
use crate::types::{
    chrono_secs, Alert, AlertHistory, AlertSeverity, AlertStatus, HistoryAction, Rule,
    MAX_DURATION_SECS, SYSTEM_ACTOR,
};

/// Default number of retries after losing an optimistic-lock race.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 1;

/// What applying a verdict did to the rule's alert.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Nothing was written: no alert and no breach, or a stale verdict.
    Unchanged,
    /// A new alert was opened.
    Created {
        /// The stored alert.
        alert: Alert,
    },
    /// The open alert was updated without a status change.
    Updated {
        /// The stored alert.
        alert: Alert,
    },
    /// The open alert changed status.
    Transitioned {
        /// The stored alert.
        alert: Alert,
        /// The status before the change.
        from: AlertStatus,
    },
}

impl TransitionOutcome {
    /// Returns the alert that was written, if any.
    #[must_use]
    pub const fn alert(&self) -> Option<&Alert> {
        match self {
            Self::Unchanged => None,
            Self::Created { alert } | Self::Updated { alert } | Self::Transitioned { alert, .. } => {
                Some(alert)
            }
        }
    }

    /// Returns true if a new alert was opened.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    /// Returns true if the alert is now firing and was not before.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        match self {
            Self::Created { alert } => alert.status == AlertStatus::Firing,
            Self::Transitioned { alert, from } => {
                alert.status == AlertStatus::Firing && *from != AlertStatus::Firing
            }
            _ => false,
        }
    }

    /// Returns true if the alert was resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Transitioned { alert, .. } if alert.status == AlertStatus::Resolved)
    }
}

/// Result of an operator action.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum ActionOutcome {
    /// The action was applied; carries the stored alert.
    Applied(Alert),
    /// The action is not valid from the alert's current status.
    Rejected {
        /// Status the alert was in.
        status: AlertStatus,
        /// Why the action was refused.
        reason: String,
    },
}

impl ActionOutcome {
    /// Returns true if the action was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns the stored alert if the action was applied.
    #[must_use]
    pub const fn alert(&self) -> Option<&Alert> {
        match self {
            Self::Applied(alert) => Some(alert),
            Self::Rejected { .. } => None,
        }
    }
}

/// Drives alerts through their lifecycle.
///
/// The manager owns the [`DedupIndex`]; all alert creation goes through it so
/// at most one alert is open per fingerprint.
#[derive(Debug)]
pub struct LifecycleManager<S> {
    store: Arc<S>,
    index: DedupIndex,
    conflict_retries: u32,
}

impl<S: AlertStore> LifecycleManager<S> {
    /// Creates a manager over an alert store with an empty index.
    ///
    /// Call [`LifecycleManager::load`] if the store may already hold open alerts.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            index: DedupIndex::new(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Sets how many times a lost version race is retried.
    #[must_use]
    pub const fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Rebuilds the dedup index from the store's open alerts.
    ///
    /// Returns the number of open alerts found.
    pub fn load(&self) -> Result<usize> {
        let open = self.store.list_open()?;
        self.index.rebuild(&open);
        info!(open = open.len(), "loaded open alerts");
        Ok(open.len())
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the dedup index.
    #[must_use]
    pub const fn index(&self) -> &DedupIndex {
        &self.index
    }

    // ============ Read side ============

    /// Returns the open alert for a fingerprint.
    pub fn open_alert(&self, fingerprint: &Fingerprint) -> Result<Option<Alert>> {
        let Some(alert_id) = self.index.lookup(fingerprint) else {
            return Ok(None);
        };
        match self.store.get(&alert_id)? {
            Some(alert) if alert.is_open() => Ok(Some(alert)),
            _ => {
                // Resolved or removed behind our back.
                self.index.release(fingerprint, &alert_id);
                debug!(fingerprint = %fingerprint, alert_id = %alert_id, "dropped stale index entry");
                Ok(None)
            }
        }
    }

    /// Returns the status of the open alert for a fingerprint.
    pub fn current_status(&self, fingerprint: &Fingerprint) -> Result<Option<AlertStatus>> {
        Ok(self.open_alert(fingerprint)?.map(|a| a.status))
    }

    /// Returns every open alert, most severe first.
    pub fn open_alerts(&self) -> Result<Vec<Alert>> {
        let mut alerts = self.store.list_open()?;
        alerts.sort_by(|a, b| {
            b.severity
                .priority()
                .cmp(&a.severity.priority())
                .then_with(|| a.starts_at.cmp(&b.starts_at))
        });
        Ok(alerts)
    }

    /// Returns the history of an alert.
    pub fn history(&self, alert_id: &str) -> Result<Vec<AlertHistory>> {
        self.store.history(alert_id)
    }

    // ============ Verdicts ============

    /// Applies an evaluation verdict for `rule`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::PersistenceConflict` if the write still loses
    /// after the configured retries, or any storage error.
    pub fn apply(&self, rule: &Rule, verdict: &EvaluationVerdict) -> Result<TransitionOutcome> {
        let fingerprint = Fingerprint::for_rule(rule);
        let mut attempt = 0;
        loop {
            match self.apply_once(rule, &fingerprint, verdict) {
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(rule_id = %rule.id, attempt, "retrying verdict after conflict");
                }
                other => return other,
            }
        }
    }

    fn apply_once(
        &self,
        rule: &Rule,
        fingerprint: &Fingerprint,
        verdict: &EvaluationVerdict,
    ) -> Result<TransitionOutcome> {
        match self.open_alert(fingerprint)? {
            Some(alert) => self.advance(rule, alert, verdict),
            None if verdict.breaching => self.open(rule, fingerprint, verdict),
            None => Ok(TransitionOutcome::Unchanged),
        }
    }

    fn open(
        &self,
        rule: &Rule,
        fingerprint: &Fingerprint,
        verdict: &EvaluationVerdict,
    ) -> Result<TransitionOutcome> {
        let status = if rule.for_duration_secs > 0 {
            AlertStatus::Pending
        } else {
            AlertStatus::Firing
        };

        let mut created = None;
        let claim = self.index.upsert(fingerprint, || {
            let mut alert = Alert::from_rule(
                rule,
                fingerprint.clone(),
                status,
                verdict.value,
                verdict.evaluated_at,
            );
            if let Some((key, text)) = &verdict.annotation {
                alert.annotations.insert((*key).to_string(), text.clone());
            }
            let history = AlertHistory::new(
                &alert,
                HistoryAction::Created,
                SYSTEM_ACTOR,
                None,
                verdict.evaluated_at,
            );
            let stored = self.create_or_adopt(alert, history)?;
            let claim = if stored.is_new {
                Claim::created(stored.alert.id.clone())
            } else {
                Claim::existing(stored.alert.id.clone())
            };
            if stored.is_new {
                created = Some(stored.alert);
            }
            Ok(claim)
        })?;

        if let Some(alert) = created {
            info!(
                alert_id = %alert.id,
                rule_id = %rule.id,
                fingerprint = %fingerprint,
                status = %alert.status,
                "alert created"
            );
            return Ok(TransitionOutcome::Created { alert });
        }

        // Another evaluation opened the alert first; fold this verdict into it.
        debug!(rule_id = %rule.id, alert_id = %claim.alert_id, "collapsed into open alert");
        match self.store.get(&claim.alert_id)? {
            Some(alert) if alert.is_open() => self.advance(rule, alert, verdict),
            _ => {
                self.index.release(fingerprint, &claim.alert_id);
                warn!(rule_id = %rule.id, alert_id = %claim.alert_id, "open alert vanished during creation");
                Ok(TransitionOutcome::Unchanged)
            }
        }
    }

    /// Inserts a new alert, adopting the store's open alert if one exists.
    fn create_or_adopt(&self, alert: Alert, history: AlertHistory) -> Result<Stored> {
        let fingerprint = alert.fingerprint.clone();
        match self.store.create(alert, history) {
            Ok(alert) => Ok(Stored { alert, is_new: true }),
            Err(AlertError::DuplicateFingerprint { .. }) => {
                let alert = self
                    .store
                    .find_open_by_fingerprint(&fingerprint)?
                    .ok_or_else(|| {
                        AlertError::Storage(format!(
                            "store rejected fingerprint {fingerprint} but holds no open alert"
                        ))
                    })?;
                Ok(Stored { alert, is_new: false })
            }
            Err(e) => Err(e),
        }
    }

    fn advance(
        &self,
        rule: &Rule,
        alert: Alert,
        verdict: &EvaluationVerdict,
    ) -> Result<TransitionOutcome> {
        let now = verdict.evaluated_at;
        if now <= alert.last_eval_at {
            debug!(alert_id = %alert.id, "ignoring stale verdict");
            return Ok(TransitionOutcome::Unchanged);
        }

        let from = alert.status;
        let mut next = alert.clone();
        next.last_eval_at = now;
        next.eval_count += 1;
        next.breaching = verdict.breaching;
        next.keep_firing_for_secs = rule.keep_firing_for_secs;
        if verdict.value.is_some() {
            next.value = verdict.value;
        }
        if verdict.breaching {
            next.last_breach_at = Some(now);
        }
        match &verdict.annotation {
            Some((key, text)) => {
                next.annotations.insert((*key).to_string(), text.clone());
            }
            None if verdict.value.is_some() => {
                next.annotations.remove(ANNOTATION_EVALUATION_ERROR);
                next.annotations.remove(ANNOTATION_NO_DATA);
            }
            None => {}
        }

        let fired = alert.fired_at.is_some();
        let debounced = now - alert.starts_at >= chrono_secs(rule.for_duration_secs);
        let action = match (from, verdict.breaching) {
            (AlertStatus::Pending, true) if debounced => {
                next.status = AlertStatus::Firing;
                next.fired_at = Some(now);
                Some(HistoryAction::Fired)
            }
            // An alert that never fired resolves on the first ok reading,
            // even if an operator acknowledged or silenced it meanwhile.
            (AlertStatus::Pending | AlertStatus::Acknowledged | AlertStatus::Silenced, false)
                if !fired =>
            {
                close(&mut next, SYSTEM_ACTOR, now);
                Some(HistoryAction::Resolved)
            }
            // Confirmed while muted: keep the operator's status, start firing semantics.
            (AlertStatus::Acknowledged | AlertStatus::Silenced, true) if !fired && debounced => {
                next.fired_at = Some(now);
                None
            }
            (AlertStatus::Firing | AlertStatus::Acknowledged, false)
                if keep_firing_elapsed(&next, now) =>
            {
                close(&mut next, SYSTEM_ACTOR, now);
                Some(HistoryAction::Resolved)
            }
            (AlertStatus::Acknowledged, true) if fired && recovered_since_ack(&alert) => {
                next.status = AlertStatus::Firing;
                next.acknowledged_by = None;
                next.acknowledged_at = None;
                Some(HistoryAction::Fired)
            }
            _ => None,
        };

        let history = match action {
            Some(action) => Some(
                AlertHistory::new(&next, action, SYSTEM_ACTOR, Some(from), now)
                    .with_old_value(alert.value),
            ),
            None if next.value != alert.value => Some(
                AlertHistory::new(&next, HistoryAction::Evaluated, SYSTEM_ACTOR, Some(from), now)
                    .with_old_value(alert.value),
            ),
            None => None,
        };

        let stored = self.store.transition(AlertWrite {
            alert: next,
            history,
        })?;

        if action.is_none() {
            debug!(alert_id = %stored.id, status = %stored.status, "alert updated");
            return Ok(TransitionOutcome::Updated { alert: stored });
        }

        if !stored.is_open() {
            self.index.release(&stored.fingerprint, &stored.id);
        }
        info!(
            alert_id = %stored.id,
            rule_id = %rule.id,
            from = %from,
            to = %stored.status,
            "alert transitioned"
        );
        Ok(TransitionOutcome::Transitioned {
            alert: stored,
            from,
        })
    }

    // ============ Operator actions ============

    /// Acknowledges a pending or firing alert.
    pub fn acknowledge(
        &self,
        alert_id: &str,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        self.act(alert_id, HistoryAction::Acknowledged, actor, comment, now, |alert| {
            match alert.status {
                AlertStatus::Pending | AlertStatus::Firing => {
                    alert.status = AlertStatus::Acknowledged;
                    alert.acknowledged_by = Some(actor.to_string());
                    alert.acknowledged_at = Some(now);
                    Ok(())
                }
                status => Err(format!("cannot acknowledge a {status} alert")),
            }
        })
    }

    /// Resolves an open alert immediately, whatever the last verdict was.
    pub fn resolve(
        &self,
        alert_id: &str,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        self.act(alert_id, HistoryAction::Resolved, actor, comment, now, |alert| {
            if !alert.is_open() {
                return Err("alert is already resolved".to_string());
            }
            close(alert, actor, now);
            Ok(())
        })
    }

    /// Silences an open alert until `now + duration`.
    ///
    /// Silencing an already silenced alert replaces its silence.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidDuration` if `duration` is zero or too long.
    pub fn silence(
        &self,
        alert_id: &str,
        silence_id: &str,
        duration: Duration,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        if duration.is_zero() || duration.as_secs() > MAX_DURATION_SECS {
            return Err(AlertError::InvalidDuration {
                reason: format!(
                    "silence duration must be between 1 and {MAX_DURATION_SECS} seconds, got {}s",
                    duration.as_secs()
                ),
            });
        }
        let expiry = now + chrono_secs(duration.as_secs().max(1));

        self.act(alert_id, HistoryAction::Silenced, actor, comment, now, |alert| {
            if !alert.is_open() {
                return Err("cannot silence a resolved alert".to_string());
            }
            alert.status = AlertStatus::Silenced;
            alert.silence_id = Some(silence_id.to_string());
            alert.silence_expiry = Some(expiry);
            Ok(())
        })
    }

    /// Lifts a silence before it expires.
    pub fn unsilence(
        &self,
        alert_id: &str,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        self.act(alert_id, HistoryAction::Unsilenced, actor, comment, now, |alert| {
            if alert.status != AlertStatus::Silenced {
                return Err(format!("cannot unsilence a {} alert", alert.status));
            }
            end_silence(alert, actor, now);
            Ok(())
        })
    }

    /// Ends every silence whose expiry has passed.
    ///
    /// Failures are logged per alert and never abort the sweep. Returns the
    /// alerts that left the silenced state.
    pub fn expire_silences(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let due: Vec<String> = self
            .store
            .list_open()?
            .into_iter()
            .filter(|a| a.status == AlertStatus::Silenced && a.silence_expiry.is_some_and(|e| e <= now))
            .map(|a| a.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for alert_id in due {
            let outcome = self.act(&alert_id, HistoryAction::SilenceExpired, SYSTEM_ACTOR, None, now, |alert| {
                // Re-checked on fresh state; an operator may have acted meanwhile.
                if alert.status != AlertStatus::Silenced || alert.silence_expiry.is_none_or(|e| e > now) {
                    return Err("silence no longer due".to_string());
                }
                end_silence(alert, SYSTEM_ACTOR, now);
                Ok(())
            });
            match outcome {
                Ok(ActionOutcome::Applied(alert)) => expired.push(alert),
                Ok(ActionOutcome::Rejected { .. }) => {}
                Err(e) => warn!(alert_id = %alert_id, error = %e, "failed to expire silence"),
            }
        }
        Ok(expired)
    }

    /// Raises an alert by hand.
    ///
    /// Manual alerts are keyed by their labels alone. Raising an alert whose
    /// labels match an open manual alert returns that alert instead.
    #[allow(clippy::too_many_arguments)]
    pub fn raise(
        &self,
        title: &str,
        severity: AlertSeverity,
        labels: HashMap<String, String>,
        value: Option<f64>,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let fingerprint = Fingerprint::compute(None, &labels);
        if let Some(existing) = self.open_alert(&fingerprint)? {
            return Ok(Claim::existing(existing.id));
        }

        let claim = self.index.upsert(&fingerprint, || {
            let alert = Alert::manual(title, fingerprint.clone(), severity, labels, value, now);
            let history = AlertHistory::new(&alert, HistoryAction::Created, actor, None, now)
                .with_comment(comment.map(str::to_string));
            let stored = self.create_or_adopt(alert, history)?;
            Ok(if stored.is_new {
                Claim::created(stored.alert.id)
            } else {
                Claim::existing(stored.alert.id)
            })
        })?;

        if claim.is_new {
            info!(alert_id = %claim.alert_id, actor = %actor, severity = %severity, "manual alert raised");
        }
        Ok(claim)
    }

    /// Applies an operator-style change with the conflict retry policy.
    ///
    /// `change` runs against freshly read state on every attempt and returns
    /// `Err(reason)` to reject the action.
    fn act<F>(
        &self,
        alert_id: &str,
        action: HistoryAction,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
        mut change: F,
    ) -> Result<ActionOutcome>
    where
        F: FnMut(&mut Alert) -> std::result::Result<(), String>,
    {
        let mut attempt = 0;
        loop {
            let current = self
                .store
                .get(alert_id)?
                .ok_or_else(|| AlertError::AlertNotFound {
                    id: alert_id.to_string(),
                })?;
            let from = current.status;

            let mut next = current.clone();
            if let Err(reason) = change(&mut next) {
                debug!(alert_id = %alert_id, action = %action, status = %from, reason = %reason, "rejected alert action");
                return Ok(ActionOutcome::Rejected {
                    status: from,
                    reason,
                });
            }

            let history = AlertHistory::new(&next, action, actor, Some(from), now)
                .with_old_value(current.value)
                .with_comment(comment.map(str::to_string));

            match self.store.transition(AlertWrite {
                alert: next,
                history: Some(history),
            }) {
                Ok(stored) => {
                    if !stored.is_open() {
                        self.index.release(&stored.fingerprint, &stored.id);
                    }
                    info!(
                        alert_id = %stored.id,
                        action = %action,
                        actor = %actor,
                        from = %from,
                        to = %stored.status,
                        "alert action applied"
                    );
                    return Ok(ActionOutcome::Applied(stored));
                }
                Err(e) if e.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(alert_id = %alert_id, action = %action, attempt, "retrying action after conflict");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct Stored {
    alert: Alert,
    is_new: bool,
}

fn close(alert: &mut Alert, actor: &str, now: DateTime<Utc>) {
    alert.status = AlertStatus::Resolved;
    alert.ends_at = Some(now);
    alert.resolved_by = Some(actor.to_string());
    alert.silence_expiry = None;
}

/// True once the condition has read ok for the alert's keep-firing window.
fn keep_firing_elapsed(alert: &Alert, now: DateTime<Utc>) -> bool {
    let last_breach = alert.last_breach_at.unwrap_or(alert.starts_at);
    now - last_breach >= chrono_secs(alert.keep_firing_for_secs)
}

/// True if an ok reading was applied after the alert was acknowledged, so the
/// current breach is a new one the acknowledgement did not cover.
fn recovered_since_ack(alert: &Alert) -> bool {
    !alert.breaching && alert.acknowledged_at.is_some_and(|at| alert.last_eval_at > at)
}

/// Leaves the silenced state.
///
/// A fired alert goes back to firing while the condition holds or the
/// keep-firing window runs, otherwise it is resolved; time spent silenced
/// counts toward the window. An alert that never fired resumes its pending
/// debounce while breaching and is resolved otherwise.
fn end_silence(alert: &mut Alert, actor: &str, now: DateTime<Utc>) {
    alert.silence_id = None;
    alert.silence_expiry = None;
    if alert.fired_at.is_none() {
        if alert.breaching {
            alert.status = AlertStatus::Pending;
        } else {
            close(alert, actor, now);
        }
    } else if alert.breaching || !keep_firing_elapsed(alert, now) {
        alert.status = AlertStatus::Firing;
    } else {
        close(alert, actor, now);
    }
}
