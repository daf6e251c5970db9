//! Storage seams for rules and alerts, with in-memory implementations.
//!
//! [`RuleStore`] and [`AlertStore`] are the narrow collaborator interfaces
//! the scheduler and lifecycle manager depend on. Alert writes go through
//! [`AlertWrite`], a versioned write: it only lands if the stored alert still
//! has the version the writer read, and the alert change and its history row
//! commit together or not at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{AlertError, Result};
use crate::fingerprint::Fingerprint;
use crate::types::{Alert, AlertHistory, Rule, RuleStatus, Verdict};

/// Bookkeeping for one completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    /// When the evaluation ran.
    pub at: DateTime<Utc>,
    /// Raw verdict of the evaluation.
    pub result: Verdict,
    /// Evaluator error, if any.
    pub error: Option<String>,
}

/// Durable rule definitions and evaluation bookkeeping.
pub trait RuleStore: Send + Sync + 'static {
    /// Returns schedulable rules whose interval has elapsed, least recently
    /// evaluated first and never-evaluated rules before all others.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<Rule>>;

    /// Gets a rule by ID.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn get(&self, rule_id: &str) -> Result<Option<Rule>>;

    /// Records the outcome of an evaluation and advances `last_eval_at`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if the rule does not exist.
    fn record_evaluation(&self, rule_id: &str, record: EvaluationRecord) -> Result<()>;

    /// Marks a rule as misconfigured so it is skipped until re-saved.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if the rule does not exist.
    fn flag_invalid(&self, rule_id: &str, reason: &str) -> Result<()>;
}

/// A versioned alert write.
///
/// `alert.version` must be the version that was read; the store bumps it on
/// success.
#[derive(Debug, Clone)]
pub struct AlertWrite {
    /// The new alert state.
    pub alert: Alert,
    /// History row committed with the change, if the change is observable.
    pub history: Option<AlertHistory>,
}

/// Durable alert records keyed by fingerprint, plus their history.
pub trait AlertStore: Send + Sync + 'static {
    /// Gets an alert by ID.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn get(&self, alert_id: &str) -> Result<Option<Alert>>;

    /// Returns the open alert for a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn find_open_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Alert>>;

    /// Returns every open alert.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn list_open(&self) -> Result<Vec<Alert>>;

    /// Inserts a new alert and its creation history row.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::DuplicateFingerprint` if an open alert already
    /// exists for the fingerprint.
    fn create(&self, alert: Alert, history: AlertHistory) -> Result<Alert>;

    /// Applies a versioned write.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::PersistenceConflict` if the stored version moved,
    /// or `AlertError::AlertNotFound` if the alert does not exist.
    fn transition(&self, write: AlertWrite) -> Result<Alert>;

    /// Appends a history row outside of a transition.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::AlertNotFound` if the alert does not exist.
    fn append_history(&self, entry: AlertHistory) -> Result<()>;

    /// Returns the history of an alert in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Storage` if the store cannot be read.
    fn history(&self, alert_id: &str) -> Result<Vec<AlertHistory>>;
}

// ============ Rules ============

/// In-memory [`RuleStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleStore {
    rules: Arc<RwLock<HashMap<String, Rule>>>,
}

impl MemoryRuleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a rule.
    ///
    /// Saving a rule clears any configuration flag left by the scheduler and
    /// keeps the existing evaluation bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the rule violates an invariant.
    pub fn save(&self, mut rule: Rule) -> Result<()> {
        rule.validate()?;
        rule.config_error = None;

        let mut rules = self.rules.write();
        if let Some(existing) = rules.get(&rule.id) {
            rule.last_eval_at = existing.last_eval_at;
            rule.last_eval_result = existing.last_eval_result;
            rule.last_eval_error.clone_from(&existing.last_eval_error);
            rule.eval_count = existing.eval_count;
        }
        info!(rule_id = %rule.id, rule_name = %rule.name, "saved alert rule");
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Inserts a rule exactly as persisted elsewhere, bookkeeping included.
    ///
    /// No validation happens here; the scheduler flags invalid rules when it
    /// meets them.
    pub fn restore(&self, rule: Rule) {
        debug!(rule_id = %rule.id, "restored alert rule");
        self.rules.write().insert(rule.id.clone(), rule);
    }

    /// Enables or disables a rule.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if the rule does not exist.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        self.update(rule_id, |rule| rule.enabled = enabled)?;
        info!(rule_id = %rule_id, enabled, "changed rule enablement");
        Ok(())
    }

    /// Changes a rule's administrative status.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if the rule does not exist.
    pub fn set_status(&self, rule_id: &str, status: RuleStatus) -> Result<()> {
        self.update(rule_id, |rule| rule.status = status)
    }

    /// Soft-deletes a rule. Open alerts keep referring to it.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if the rule does not exist.
    pub fn soft_delete(&self, rule_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.update(rule_id, |rule| {
            rule.enabled = false;
            if rule.deleted_at.is_none() {
                rule.deleted_at = Some(now);
            }
        })?;
        info!(rule_id = %rule_id, "soft-deleted alert rule");
        Ok(())
    }

    /// Returns all rules, including soft-deleted ones.
    #[must_use]
    pub fn list(&self) -> Vec<Rule> {
        self.rules.read().values().cloned().collect()
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Returns true if the store holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    fn update(&self, rule_id: &str, f: impl FnOnce(&mut Rule)) -> Result<()> {
        let mut rules = self.rules.write();
        let rule = rules.get_mut(rule_id).ok_or_else(|| AlertError::RuleNotFound {
            id: rule_id.to_string(),
        })?;
        f(rule);
        Ok(())
    }
}

impl RuleStore for MemoryRuleStore {
    fn fetch_due(&self, now: DateTime<Utc>) -> Result<Vec<Rule>> {
        let rules = self.rules.read();
        let mut due: Vec<Rule> = rules.values().filter(|r| r.is_due(now)).cloned().collect();
        // `None` orders before `Some`, which puts never-evaluated rules first.
        due.sort_by(|a, b| a.last_eval_at.cmp(&b.last_eval_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    fn get(&self, rule_id: &str) -> Result<Option<Rule>> {
        Ok(self.rules.read().get(rule_id).cloned())
    }

    fn record_evaluation(&self, rule_id: &str, record: EvaluationRecord) -> Result<()> {
        self.update(rule_id, |rule| {
            if rule.last_eval_at.is_none_or(|last| last < record.at) {
                rule.last_eval_at = Some(record.at);
            }
            rule.last_eval_result = Some(record.result);
            rule.last_eval_error = record.error;
            rule.eval_count += 1;
        })
    }

    fn flag_invalid(&self, rule_id: &str, reason: &str) -> Result<()> {
        self.update(rule_id, |rule| rule.config_error = Some(reason.to_string()))
    }
}

// ============ Alerts ============

#[derive(Debug, Default)]
struct AlertTables {
    alerts: HashMap<String, Alert>,
    open_by_fingerprint: HashMap<Fingerprint, String>,
    history: Vec<AlertHistory>,
}

/// In-memory [`AlertStore`].
///
/// All tables sit behind one lock, which makes every write a transaction.
/// Failure injection hooks let tests exercise conflict and outage paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertStore {
    tables: Arc<RwLock<AlertTables>>,
    injected_conflicts: Arc<AtomicUsize>,
    injected_failures: Arc<AtomicUsize>,
}

impl MemoryAlertStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` transitions lose to a simulated concurrent writer.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` writes fail with a storage error.
    pub fn inject_failures(&self, n: usize) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Returns every stored alert, open or resolved.
    #[must_use]
    pub fn list_all(&self) -> Vec<Alert> {
        self.tables.read().alerts.values().cloned().collect()
    }

    /// Returns the total number of history rows.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.tables.read().history.len()
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_failure(&self) -> Result<()> {
        if Self::take_injected(&self.injected_failures) {
            return Err(AlertError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl AlertStore for MemoryAlertStore {
    fn get(&self, alert_id: &str) -> Result<Option<Alert>> {
        Ok(self.tables.read().alerts.get(alert_id).cloned())
    }

    fn find_open_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<Alert>> {
        let tables = self.tables.read();
        Ok(tables
            .open_by_fingerprint
            .get(fingerprint)
            .and_then(|id| tables.alerts.get(id))
            .cloned())
    }

    fn list_open(&self) -> Result<Vec<Alert>> {
        Ok(self
            .tables
            .read()
            .alerts
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect())
    }

    fn create(&self, mut alert: Alert, history: AlertHistory) -> Result<Alert> {
        self.check_failure()?;
        let mut tables = self.tables.write();

        if tables.open_by_fingerprint.contains_key(&alert.fingerprint) {
            return Err(AlertError::DuplicateFingerprint {
                fingerprint: alert.fingerprint.to_string(),
            });
        }

        alert.version = 1;
        if alert.is_open() {
            tables
                .open_by_fingerprint
                .insert(alert.fingerprint.clone(), alert.id.clone());
        }
        tables.alerts.insert(alert.id.clone(), alert.clone());
        tables.history.push(history);
        debug!(alert_id = %alert.id, fingerprint = %alert.fingerprint, "stored new alert");
        Ok(alert)
    }

    fn transition(&self, write: AlertWrite) -> Result<Alert> {
        self.check_failure()?;
        let mut tables = self.tables.write();
        let AlertWrite { mut alert, history } = write;

        let stored = tables
            .alerts
            .get_mut(&alert.id)
            .ok_or_else(|| AlertError::AlertNotFound {
                id: alert.id.clone(),
            })?;

        if Self::take_injected(&self.injected_conflicts) {
            stored.version += 1;
        }
        if stored.version != alert.version {
            return Err(AlertError::PersistenceConflict {
                alert_id: alert.id.clone(),
                expected: alert.version,
                found: stored.version,
            });
        }

        alert.version += 1;
        *stored = alert.clone();

        if !alert.is_open()
            && tables
                .open_by_fingerprint
                .get(&alert.fingerprint)
                .is_some_and(|id| *id == alert.id)
        {
            tables.open_by_fingerprint.remove(&alert.fingerprint);
        }
        if let Some(entry) = history {
            tables.history.push(entry);
        }
        Ok(alert)
    }

    fn append_history(&self, entry: AlertHistory) -> Result<()> {
        self.check_failure()?;
        let mut tables = self.tables.write();
        if !tables.alerts.contains_key(&entry.alert_id) {
            return Err(AlertError::AlertNotFound {
                id: entry.alert_id.clone(),
            });
        }
        tables.history.push(entry);
        Ok(())
    }

    fn history(&self, alert_id: &str) -> Result<Vec<AlertHistory>> {
        Ok(self
            .tables
            .read()
            .history
            .iter()
            .filter(|h| h.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, ComparisonOperator, HistoryAction, SYSTEM_ACTOR};

    fn rule(id: &str) -> Rule {
        Rule::builder(id, "q", ComparisonOperator::GreaterThan, 1.0)
            .id(id)
            .interval_secs(60)
            .build()
            .unwrap()
    }

    fn open_alert(rule: &Rule, now: DateTime<Utc>) -> (Alert, AlertHistory) {
        let alert = Alert::from_rule(rule, Fingerprint::for_rule(rule), AlertStatus::Firing, Some(2.0), now);
        let history = AlertHistory::new(&alert, HistoryAction::Created, SYSTEM_ACTOR, None, now);
        (alert, history)
    }

    mod rule_store_tests {
        use super::*;

        #[test]
        fn fetch_due_orders_never_evaluated_first() {
            let store = MemoryRuleStore::new();
            let now = Utc::now();
            for id in ["a", "b", "c"] {
                store.save(rule(id)).unwrap();
            }
            store
                .record_evaluation(
                    "a",
                    EvaluationRecord { at: now - chrono::Duration::seconds(300), result: Verdict::Ok, error: None },
                )
                .unwrap();
            store
                .record_evaluation(
                    "b",
                    EvaluationRecord { at: now - chrono::Duration::seconds(600), result: Verdict::Ok, error: None },
                )
                .unwrap();

            let due: Vec<String> = store.fetch_due(now).unwrap().into_iter().map(|r| r.id).collect();
            assert_eq!(due, vec!["c", "b", "a"]);
        }

        #[test]
        fn record_evaluation_updates_bookkeeping() {
            let store = MemoryRuleStore::new();
            store.save(rule("a")).unwrap();
            let now = Utc::now();
            store
                .record_evaluation(
                    "a",
                    EvaluationRecord { at: now, result: Verdict::Error, error: Some("timeout".to_string()) },
                )
                .unwrap();

            let r = store.get("a").unwrap().unwrap();
            assert_eq!(r.last_eval_at, Some(now));
            assert_eq!(r.last_eval_result, Some(Verdict::Error));
            assert_eq!(r.last_eval_error.as_deref(), Some("timeout"));
            assert_eq!(r.eval_count, 1);
            assert!(store.fetch_due(now).unwrap().is_empty());
        }

        #[test]
        fn flagged_rule_is_skipped_until_saved_again() {
            let store = MemoryRuleStore::new();
            store.save(rule("a")).unwrap();
            store.flag_invalid("a", "bad expression").unwrap();
            assert!(store.fetch_due(Utc::now()).unwrap().is_empty());

            store.save(rule("a")).unwrap();
            assert_eq!(store.fetch_due(Utc::now()).unwrap().len(), 1);
        }

        #[test]
        fn save_keeps_bookkeeping() {
            let store = MemoryRuleStore::new();
            store.save(rule("a")).unwrap();
            let now = Utc::now();
            store
                .record_evaluation("a", EvaluationRecord { at: now, result: Verdict::Ok, error: None })
                .unwrap();
            store.save(rule("a")).unwrap();
            assert_eq!(store.get("a").unwrap().unwrap().eval_count, 1);
        }

        #[test]
        fn disabled_and_deleted_rules_are_not_due() {
            let store = MemoryRuleStore::new();
            store.save(rule("a")).unwrap();
            store.save(rule("b")).unwrap();
            store.set_enabled("a", false).unwrap();
            store.soft_delete("b", Utc::now()).unwrap();

            assert!(store.fetch_due(Utc::now()).unwrap().is_empty());
            assert_eq!(store.len(), 2);
        }

        #[test]
        fn unknown_rule_is_reported() {
            let store = MemoryRuleStore::new();
            let err = store.flag_invalid("missing", "x").unwrap_err();
            assert!(matches!(err, AlertError::RuleNotFound { .. }));
        }
    }

    mod alert_store_tests {
        use super::*;

        #[test]
        fn create_is_conditional_on_fingerprint() {
            let store = MemoryAlertStore::new();
            let r = rule("a");
            let now = Utc::now();
            let (first, h1) = open_alert(&r, now);
            let (second, h2) = open_alert(&r, now);

            let stored = store.create(first, h1).unwrap();
            assert_eq!(stored.version, 1);
            let err = store.create(second, h2).unwrap_err();
            assert!(matches!(err, AlertError::DuplicateFingerprint { .. }));
            assert_eq!(store.list_open().unwrap().len(), 1);
        }

        #[test]
        fn transition_checks_version() {
            let store = MemoryAlertStore::new();
            let r = rule("a");
            let (alert, history) = open_alert(&r, Utc::now());
            let stored = store.create(alert, history).unwrap();

            let mut update = stored.clone();
            update.value = Some(3.0);
            let written = store.transition(AlertWrite { alert: update, history: None }).unwrap();
            assert_eq!(written.version, 2);

            let mut stale = stored;
            stale.value = Some(4.0);
            let err = store.transition(AlertWrite { alert: stale, history: None }).unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(store.get(&written.id).unwrap().unwrap().value, Some(3.0));
        }

        #[test]
        fn resolving_frees_the_fingerprint() {
            let store = MemoryAlertStore::new();
            let r = rule("a");
            let now = Utc::now();
            let (alert, history) = open_alert(&r, now);
            let mut stored = store.create(alert, history).unwrap();

            stored.status = AlertStatus::Resolved;
            let row = AlertHistory::new(&stored, HistoryAction::Resolved, SYSTEM_ACTOR, Some(AlertStatus::Firing), now);
            store.transition(AlertWrite { alert: stored.clone(), history: Some(row) }).unwrap();

            assert!(store.find_open_by_fingerprint(&stored.fingerprint).unwrap().is_none());
            assert_eq!(store.history(&stored.id).unwrap().len(), 2);

            let (again, h) = open_alert(&r, now);
            assert!(store.create(again, h).is_ok());
        }

        #[test]
        fn failed_write_persists_nothing() {
            let store = MemoryAlertStore::new();
            let r = rule("a");
            let (alert, history) = open_alert(&r, Utc::now());
            let stored = store.create(alert, history).unwrap();

            store.inject_failures(1);
            let mut update = stored.clone();
            update.status = AlertStatus::Acknowledged;
            let row = AlertHistory::new(&update, HistoryAction::Acknowledged, "alice", Some(AlertStatus::Firing), Utc::now());
            assert!(store.transition(AlertWrite { alert: update, history: Some(row) }).is_err());

            assert_eq!(store.get(&stored.id).unwrap().unwrap().status, AlertStatus::Firing);
            assert_eq!(store.history_len(), 1);
        }

        #[test]
        fn append_history_requires_alert() {
            let store = MemoryAlertStore::new();
            let r = rule("a");
            let (alert, history) = open_alert(&r, Utc::now());
            assert!(store.append_history(history.clone()).is_err());
            store.create(alert, history.clone()).unwrap();
            assert!(store.append_history(history).is_ok());
        }
    }
}
