//! Rule evaluation scheduler and alert lifecycle state machine for Clawbernetes.
//!
//! `claw-alerting` decides when a monitored condition becomes an actionable
//! problem and tracks that problem through acknowledgment, silence and
//! resolution without ever opening two alerts for the same condition.
//!
//! # Features
//!
//! - **Hysteresis**: A firing alert only recovers once the sample crosses the
//!   rule's recovery threshold
//! - **For Duration**: A breach must hold before a pending alert fires
//! - **Keep Firing For**: A firing alert must read ok for a while before it resolves
//! - **No-data and error policies**: Missing samples and evaluator failures
//!   are treated as ok, as a breach, or as an annotated breach
//! - **Deduplication**: One open alert per fingerprint, even under concurrent evaluation
//! - **Audited lifecycle**: Every status change commits with a history row
//!
//! # Example
//!
//! ```rust
//! use claw_alerting::{
//!     engine, AlertStatus, ComparisonOperator, LifecycleManager, MemoryAlertStore, Rule,
//!     SampleOutcome,
//! };
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! let manager = LifecycleManager::new(Arc::new(MemoryAlertStore::new()));
//!
//! // cpu_usage > 80, recovering only once it drops to 60
//! let rule = Rule::builder("HighCPU", "avg(cpu_usage)", ComparisonOperator::GreaterThan, 80.0)
//!     .recovery_threshold(60.0)
//!     .label("team", "platform")
//!     .build()
//!     .unwrap();
//!
//! let now = Utc::now();
//! let verdict = engine::evaluate(&rule, &SampleOutcome::Value(85.0), None, now);
//! let outcome = manager.apply(&rule, &verdict).unwrap();
//! let alert = outcome.alert().unwrap();
//! assert_eq!(alert.status, AlertStatus::Firing);
//!
//! // 70 sits between the bounds: the alert keeps firing.
//! let later = now + chrono::Duration::seconds(60);
//! let verdict = engine::evaluate(&rule, &SampleOutcome::Value(70.0), Some(alert), later);
//! let outcome = manager.apply(&rule, &verdict).unwrap();
//! assert_eq!(outcome.alert().unwrap().status, AlertStatus::Firing);
//! ```
//!
//! # Running the scheduler
//!
//! ```rust,ignore
//! use claw_alerting::{InFlightRegistry, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     rule_store,
//!     lifecycle,
//!     evaluator,
//!     InFlightRegistry::new(),
//! )?;
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(async move { scheduler.run(shutdown_rx).await });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod lifecycle;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use config::SchedulerConfig;
pub use engine::{EvaluationVerdict, SampleOutcome};
pub use error::{AlertError, Result};
pub use evaluator::{Evaluator, FakeEvaluator, FakeOutcome};
pub use fingerprint::{Claim, DedupIndex, Fingerprint};
pub use lifecycle::{ActionOutcome, LifecycleManager, TransitionOutcome};
pub use scheduler::{InFlightGuard, InFlightRegistry, Scheduler, TickReport};
pub use store::{
    AlertStore, AlertWrite, EvaluationRecord, MemoryAlertStore, MemoryRuleStore, RuleStore,
};
pub use types::{
    Alert, AlertHistory, AlertSeverity, AlertStatus, ComparisonOperator, HistoryAction, Rule,
    RuleBuilder, RuleStatus, StatePolicy, Verdict, SYSTEM_ACTOR,
};
