//! Pipeline-run and step-run logs.
//!
//! A pipeline run is finalized exactly once; a step run's end fields are
//! written exactly once. Both guarantees are conditional writes on the
//! record's status.

mod memory;

pub use memory::MemoryRunLog;

use crate::core::{PipelineRun, RunStatus, StepRun};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal fields written when a record finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// `COMPLETED` or `FAILED`.
    pub status: RunStatus,
    /// Finish time.
    pub end_time: DateTime<Utc>,
    /// Rows processed, for step runs.
    pub rows_processed: u64,
    /// Failure reason.
    pub error_message: Option<String>,
}

impl RunOutcome {
    /// A successful outcome finishing now.
    #[must_use]
    pub fn completed(rows_processed: u64) -> Self {
        Self {
            status: RunStatus::Completed,
            end_time: Utc::now(),
            rows_processed,
            error_message: None,
        }
    }

    /// A failed outcome finishing now.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            end_time: Utc::now(),
            rows_processed: 0,
            error_message: Some(error.into()),
        }
    }
}

/// Storage for `PipelineRuns` and `StepRuns`.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    /// Records a new `RUNNING` pipeline run.
    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<()>;

    /// Writes the terminal status if the run is still `RUNNING`.
    ///
    /// Returns false if it was already finalized.
    async fn finalize_pipeline_run(&self, pipeline_run_id: Uuid, outcome: &RunOutcome) -> Result<bool>;

    /// Fetches a pipeline run.
    async fn get_pipeline_run(&self, pipeline_run_id: Uuid) -> Result<Option<PipelineRun>>;

    /// Pipeline runs of one tenant, oldest first.
    async fn pipeline_runs(&self, tenant_id: &str) -> Result<Vec<PipelineRun>>;

    /// Records a new `RUNNING` step run.
    async fn insert_step_run(&self, step: &StepRun) -> Result<()>;

    /// Writes the end fields if the step is still `RUNNING`.
    async fn finish_step_run(&self, step_run_id: Uuid, outcome: &RunOutcome) -> Result<bool>;

    /// Step runs of one pipeline run, in start order.
    async fn step_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<StepRun>>;
}
