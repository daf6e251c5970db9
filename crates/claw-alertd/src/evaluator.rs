//! File-backed evaluator.
//!
//! Reads a JSON object mapping each rule expression to its current sample,
//! for example `{"avg(cpu_usage)": 83.5, "disk_used": null}`. The file is
//! re-read on every evaluation so an external collector can rewrite it.
//! A missing key or a `null` value means no data.

use std::collections::HashMap;
use std::path::PathBuf;

use claw_alerting::{AlertError, Evaluator, Result, Rule};

/// Evaluator backed by a samples file.
#[derive(Debug, Clone)]
pub struct FileEvaluator {
    path: PathBuf,
}

impl FileEvaluator {
    /// Creates an evaluator reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, Option<f64>>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AlertError::EvaluatorUnavailable {
                reason: format!("failed to read samples file '{}': {e}", self.path.display()),
            }
        })?;
        serde_json::from_str(&content).map_err(|e| AlertError::EvaluatorUnavailable {
            reason: format!("invalid samples file '{}': {e}", self.path.display()),
        })
    }
}

impl Evaluator for FileEvaluator {
    async fn evaluate(&self, rule: &Rule) -> Result<Option<f64>> {
        let samples = self.load().await?;
        Ok(samples.get(&rule.expression).copied().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_alerting::ComparisonOperator;

    fn rule(expression: &str) -> Rule {
        Rule::builder("r", expression, ComparisonOperator::GreaterThan, 1.0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn reads_samples_by_expression() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.json");
        std::fs::write(&path, r#"{"cpu": 83.5, "disk": null}"#).unwrap();

        let evaluator = FileEvaluator::new(&path);
        assert_eq!(evaluator.evaluate(&rule("cpu")).await.unwrap(), Some(83.5));
        assert_eq!(evaluator.evaluate(&rule("disk")).await.unwrap(), None);
        assert_eq!(evaluator.evaluate(&rule("memory")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn picks_up_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.json");
        std::fs::write(&path, r#"{"cpu": 10}"#).unwrap();
        let evaluator = FileEvaluator::new(&path);
        assert_eq!(evaluator.evaluate(&rule("cpu")).await.unwrap(), Some(10.0));

        std::fs::write(&path, r#"{"cpu": 95}"#).unwrap();
        assert_eq!(evaluator.evaluate(&rule("cpu")).await.unwrap(), Some(95.0));
    }

    #[tokio::test]
    async fn missing_or_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.json");
        let evaluator = FileEvaluator::new(&path);
        assert!(matches!(
            evaluator.evaluate(&rule("cpu")).await,
            Err(AlertError::EvaluatorUnavailable { .. })
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            evaluator.evaluate(&rule("cpu")).await,
            Err(AlertError::EvaluatorUnavailable { .. })
        ));
    }
}
