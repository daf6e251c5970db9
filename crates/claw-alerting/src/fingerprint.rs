//! Alert fingerprints and the deduplication index.
//!
//! A [`Fingerprint`] is a deterministic digest of a rule ID and its label set.
//! The [`DedupIndex`] maps each fingerprint to its single open alert and makes
//! lookup-then-create one atomic step, so concurrent evaluations that land on
//! the same fingerprint collapse into one alert.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::{Alert, Rule};

/// Deterministic identifier for one condition instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Number of hex characters kept from the digest.
    const HEX_LEN: usize = 32;

    /// Computes the fingerprint of a rule ID (absent for manual alerts) and a label set.
    ///
    /// Labels are hashed in key order and every field is length-prefixed, so
    /// the result does not depend on map iteration order or on how values
    /// happen to concatenate.
    #[must_use]
    pub fn compute(rule_id: Option<&str>, labels: &HashMap<String, String>) -> Self {
        let mut hasher = blake3::Hasher::new();

        match rule_id {
            Some(id) => {
                hasher.update(&[1]);
                update_field(&mut hasher, id);
            }
            None => {
                hasher.update(&[0]);
            }
        }

        let mut sorted: Vec<_> = labels.iter().collect();
        sorted.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        for (k, v) in sorted {
            update_field(&mut hasher, k);
            update_field(&mut hasher, v);
        }

        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..Self::HEX_LEN].to_string())
    }

    /// Computes the fingerprint of a rule's alerts.
    #[must_use]
    pub fn for_rule(rule: &Rule) -> Self {
        Self::compute(Some(&rule.id), &rule.labels)
    }

    /// Returns the fingerprint as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn update_field(hasher: &mut blake3::Hasher, field: &str) {
    hasher.update(&(field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of claiming a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The open alert now registered for the fingerprint.
    pub alert_id: String,
    /// True if the alert was created by this claim.
    pub is_new: bool,
}

impl Claim {
    /// A claim that created a new alert.
    #[must_use]
    pub fn created(alert_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            is_new: true,
        }
    }

    /// A claim that found an alert already open.
    #[must_use]
    pub fn existing(alert_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            is_new: false,
        }
    }
}

/// Maps fingerprints to their single open alert.
#[derive(Debug, Default)]
pub struct DedupIndex {
    open: Mutex<HashMap<Fingerprint, String>>,
}

impl DedupIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open alert registered for a fingerprint.
    #[must_use]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.open.lock().get(fingerprint).cloned()
    }

    /// Returns the open alert for `fingerprint`, creating one if none is registered.
    ///
    /// `create` runs while the index is locked, so no other caller can
    /// register the same fingerprint between the lookup and the insert. It
    /// may itself report an existing alert (for example when the backing
    /// store already holds one), which is then adopted.
    ///
    /// # Errors
    ///
    /// Propagates any error from `create`; the fingerprint stays unclaimed.
    pub fn upsert<F>(&self, fingerprint: &Fingerprint, create: F) -> Result<Claim>
    where
        F: FnOnce() -> Result<Claim>,
    {
        let mut open = self.open.lock();
        if let Some(alert_id) = open.get(fingerprint) {
            return Ok(Claim::existing(alert_id.clone()));
        }

        let claim = create()?;
        open.insert(fingerprint.clone(), claim.alert_id.clone());
        debug!(fingerprint = %fingerprint, alert_id = %claim.alert_id, is_new = claim.is_new, "claimed fingerprint");
        Ok(claim)
    }

    /// Releases a fingerprint if it still points at `alert_id`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn release(&self, fingerprint: &Fingerprint, alert_id: &str) -> bool {
        let mut open = self.open.lock();
        if open.get(fingerprint).is_some_and(|id| id == alert_id) {
            open.remove(fingerprint);
            debug!(fingerprint = %fingerprint, alert_id = %alert_id, "released fingerprint");
            true
        } else {
            false
        }
    }

    /// Replaces the index contents with the given open alerts.
    pub fn rebuild<'a>(&self, alerts: impl IntoIterator<Item = &'a Alert>) {
        let mut open = self.open.lock();
        open.clear();
        for alert in alerts.into_iter().filter(|a| a.is_open()) {
            open.insert(alert.fingerprint.clone(), alert.id.clone());
        }
        debug!(open = open.len(), "rebuilt dedup index");
    }

    /// Returns the number of open fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    /// Returns true if no fingerprint is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlertError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    mod fingerprint_tests {
        use super::*;

        #[test]
        fn same_rule_and_labels_same_fingerprint() {
            let a = Fingerprint::compute(Some("r1"), &labels(&[("host", "a"), ("dc", "x")]));
            let b = Fingerprint::compute(Some("r1"), &labels(&[("dc", "x"), ("host", "a")]));
            assert_eq!(a, b);
            assert_eq!(a.as_str().len(), 32);
        }

        #[test]
        fn different_labels_different_fingerprint() {
            let a = Fingerprint::compute(Some("r1"), &labels(&[("host", "a")]));
            let b = Fingerprint::compute(Some("r1"), &labels(&[("host", "b")]));
            assert_ne!(a, b);
        }

        #[test]
        fn manual_alerts_differ_from_rule_alerts() {
            let l = labels(&[("host", "a")]);
            assert_ne!(Fingerprint::compute(None, &l), Fingerprint::compute(Some(""), &l));
        }

        #[test]
        fn field_boundaries_are_unambiguous() {
            let a = Fingerprint::compute(Some("r"), &labels(&[("ab", "c")]));
            let b = Fingerprint::compute(Some("r"), &labels(&[("a", "bc")]));
            assert_ne!(a, b);
        }

        proptest! {
            #[test]
            fn prop_fingerprint_ignores_insertion_order(
                pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 0..8)
            ) {
                let forward: HashMap<String, String> = pairs.iter().cloned().collect();
                let reversed: HashMap<String, String> = pairs.iter().rev().cloned().collect();
                // Duplicate keys keep different winners depending on order.
                prop_assume!(forward == reversed);
                prop_assert_eq!(
                    Fingerprint::compute(Some("rule"), &forward),
                    Fingerprint::compute(Some("rule"), &reversed)
                );
            }
        }
    }

    mod index_tests {
        use super::*;

        fn fp(name: &str) -> Fingerprint {
            Fingerprint::compute(Some(name), &HashMap::new())
        }

        #[test]
        fn upsert_creates_once() {
            let index = DedupIndex::new();
            let first = index.upsert(&fp("a"), || Ok(Claim::created("alert-1"))).unwrap();
            let second = index.upsert(&fp("a"), || Ok(Claim::created("alert-2"))).unwrap();

            assert_eq!(first, Claim::created("alert-1"));
            assert_eq!(second, Claim::existing("alert-1"));
            assert_eq!(index.len(), 1);
        }

        #[test]
        fn failed_create_leaves_fingerprint_unclaimed() {
            let index = DedupIndex::new();
            let result = index.upsert(&fp("a"), || Err(AlertError::Storage("down".to_string())));
            assert!(result.is_err());
            assert!(index.lookup(&fp("a")).is_none());
        }

        #[test]
        fn release_requires_matching_alert() {
            let index = DedupIndex::new();
            index.upsert(&fp("a"), || Ok(Claim::created("alert-1"))).unwrap();

            assert!(!index.release(&fp("a"), "alert-2"));
            assert_eq!(index.lookup(&fp("a")).as_deref(), Some("alert-1"));
            assert!(index.release(&fp("a"), "alert-1"));
            assert!(index.is_empty());
        }

        #[test]
        fn concurrent_upserts_create_exactly_one() {
            let index = Arc::new(DedupIndex::new());
            let created = Arc::new(AtomicUsize::new(0));
            let target = fp("shared");

            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let index = Arc::clone(&index);
                    let created = Arc::clone(&created);
                    let target = target.clone();
                    std::thread::spawn(move || {
                        index
                            .upsert(&target, || {
                                created.fetch_add(1, Ordering::SeqCst);
                                Ok(Claim::created(format!("alert-{i}")))
                            })
                            .unwrap()
                    })
                })
                .collect();

            let claims: Vec<Claim> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(created.load(Ordering::SeqCst), 1);
            assert_eq!(claims.iter().filter(|c| c.is_new).count(), 1);
            let winner = &claims.iter().find(|c| c.is_new).unwrap().alert_id;
            assert!(claims.iter().all(|c| &c.alert_id == winner));
        }
    }
}
