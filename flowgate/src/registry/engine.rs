//! The unit-of-work contract implemented by every step type.

use super::StepContext;
use crate::errors::FlowgateError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

/// Step-local configuration, as declared in the pipeline definition.
pub type StepConfig = serde_json::Map<String, Value>;

/// Outcome status of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The step did its work.
    Success,
    /// The step failed; `error` says why.
    Failed,
}

/// What an engine reports back to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Success or failure.
    pub status: StepStatus,
    /// Rows the step processed.
    pub rows_processed: u64,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Engine-specific details, recorded in audit events.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl StepResult {
    /// A successful result.
    #[must_use]
    pub fn success(rows_processed: u64) -> Self {
        Self {
            status: StepStatus::Success,
            rows_processed,
            error: None,
            details: HashMap::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            rows_processed: 0,
            error: Some(error.into()),
            details: HashMap::new(),
        }
    }

    /// A failed result from an opaque business error, keeping its cause chain.
    #[must_use]
    pub fn failed_from(error: anyhow::Error) -> Self {
        Self::failed(format!("{error:#}"))
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Returns true on success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

impl From<FlowgateError> for StepResult {
    fn from(err: FlowgateError) -> Self {
        Self::failed(err.to_string()).with_detail("kind", err.kind().to_string())
    }
}

/// A pluggable unit of work, resolved by type string through the
/// [`EngineRegistry`](super::EngineRegistry).
///
/// Engines must not retain anything from the context past the call; the
/// credential lease in particular is cleared as soon as the step ends.
#[async_trait]
pub trait StepEngine: Send + Sync + Debug {
    /// Runs one step.
    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_failed_from_keeps_cause_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("loading cost rows")
            .unwrap_err();
        let result = StepResult::failed_from(err);

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("loading cost rows: connection reset"));
    }

    #[test]
    fn test_from_flowgate_error() {
        let result = StepResult::from(FlowgateError::transient("503"));
        assert!(!result.is_success());
        assert_eq!(result.details.get("kind").unwrap(), "transient_storage");
    }

    #[test]
    fn test_success_serialization_skips_empty() {
        let json = serde_json::to_value(StepResult::success(12)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "SUCCESS", "rows_processed": 12}));
    }
}
