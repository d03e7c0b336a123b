//! Results of one pipeline invocation.

use crate::core::RunStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How one step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Step id.
    pub step_id: String,
    /// The step run record.
    pub step_run_id: Uuid,
    /// `COMPLETED` or `FAILED`.
    pub status: RunStatus,
    /// Rows reported by the engine.
    pub rows_processed: u64,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the step was optional.
    pub optional: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// How one pipeline invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// The pipeline run record.
    pub pipeline_run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Pipeline id.
    pub pipeline_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Steps that ran, in order.
    pub steps: Vec<StepSummary>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl ExecutionSummary {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Rows processed by completed steps.
    #[must_use]
    pub fn rows_processed(&self) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.status == RunStatus::Completed)
            .map(|s| s.rows_processed)
            .sum()
    }

    /// The first required step that failed.
    #[must_use]
    pub fn failed_step(&self) -> Option<&StepSummary> {
        self.steps
            .iter()
            .find(|s| s.status == RunStatus::Failed && !s.optional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, status: RunStatus, rows: u64, optional: bool) -> StepSummary {
        StepSummary {
            step_id: id.to_string(),
            step_run_id: Uuid::now_v7(),
            status,
            rows_processed: rows,
            error: None,
            optional,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_rows_and_failed_step() {
        let summary = ExecutionSummary {
            pipeline_run_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            pipeline_id: "p".to_string(),
            status: RunStatus::Failed,
            steps: vec![
                step("a", RunStatus::Completed, 10, false),
                step("b", RunStatus::Failed, 3, true),
                step("c", RunStatus::Completed, 5, false),
                step("d", RunStatus::Failed, 0, false),
            ],
            error_message: Some("boom".to_string()),
            duration_ms: 4,
        };

        assert_eq!(summary.rows_processed(), 15);
        assert_eq!(summary.failed_step().unwrap().step_id, "d");
        assert!(!summary.is_success());
    }
}
