//! Assertions over run records and warehouse rows.

use crate::core::{PipelineRun, RunStatus, StepRun, LINEAGE_COLUMNS, RUN_ID_COLUMN};
use crate::warehouse::Row;
use serde_json::Value;

/// Asserts that `run` ended with `expected` and has an end time.
pub fn assert_run_finished(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected pipeline run {} to be {expected}, got {} ({:?})",
        run.pipeline_run_id, run.status, run.error_message
    );
    assert!(run.end_time.is_some(), "Pipeline run has no end time");
}

/// Asserts step ids and statuses, in order.
pub fn assert_step_statuses(steps: &[StepRun], expected: &[(&str, RunStatus)]) {
    let actual: Vec<(&str, RunStatus)> = steps
        .iter()
        .map(|s| (s.step_id.as_str(), s.status))
        .collect();
    assert_eq!(actual, expected, "Unexpected step runs");
    for step in steps {
        assert!(
            step.end_time.is_some(),
            "Step run '{}' has no end time",
            step.step_id
        );
    }
}

/// Asserts every row carries the lineage columns and was written by `run_id`.
pub fn assert_rows_tagged(rows: &[Row], run_id: &str) {
    for (i, row) in rows.iter().enumerate() {
        for column in LINEAGE_COLUMNS {
            assert!(
                row.get(column).is_some_and(|v| !v.is_null()),
                "Row {i} is missing lineage column '{column}'"
            );
        }
        assert_eq!(
            row.get(RUN_ID_COLUMN),
            Some(&Value::from(run_id)),
            "Row {i} was written by another run"
        );
    }
}
