//! In-memory [`RunLogStore`].

use super::{RunLogStore, RunOutcome};
use crate::core::{PipelineRun, RunStatus, StepRun};
use crate::errors::{FlowgateError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// A [`RunLogStore`] in process memory.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    pipeline_runs: RwLock<HashMap<Uuid, PipelineRun>>,
    step_runs: RwLock<Vec<StepRun>>,
    transient_failures: AtomicUsize,
}

impl MemoryRunLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` calls with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Every pipeline run, in no particular order.
    #[must_use]
    pub fn all_pipeline_runs(&self) -> Vec<PipelineRun> {
        self.pipeline_runs.read().values().cloned().collect()
    }

    fn maybe_fail(&self) -> Result<()> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FlowgateError::transient("run log unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RunLogStore for MemoryRunLog {
    async fn insert_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        self.maybe_fail()?;
        self.pipeline_runs
            .write()
            .entry(run.pipeline_run_id)
            .or_insert_with(|| run.clone());
        Ok(())
    }

    async fn finalize_pipeline_run(&self, pipeline_run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        self.maybe_fail()?;
        let mut runs = self.pipeline_runs.write();
        let run = runs
            .get_mut(&pipeline_run_id)
            .ok_or_else(|| FlowgateError::NotFound(format!("pipeline run {pipeline_run_id}")))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = outcome.status;
        run.end_time = Some(outcome.end_time);
        run.error_message.clone_from(&outcome.error_message);
        Ok(true)
    }

    async fn get_pipeline_run(&self, pipeline_run_id: Uuid) -> Result<Option<PipelineRun>> {
        self.maybe_fail()?;
        Ok(self.pipeline_runs.read().get(&pipeline_run_id).cloned())
    }

    async fn pipeline_runs(&self, tenant_id: &str) -> Result<Vec<PipelineRun>> {
        self.maybe_fail()?;
        let mut runs: Vec<_> = self
            .pipeline_runs
            .read()
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.start_time);
        Ok(runs)
    }

    async fn insert_step_run(&self, step: &StepRun) -> Result<()> {
        self.maybe_fail()?;
        let mut steps = self.step_runs.write();
        if !steps.iter().any(|s| s.step_run_id == step.step_run_id) {
            steps.push(step.clone());
        }
        Ok(())
    }

    async fn finish_step_run(&self, step_run_id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        self.maybe_fail()?;
        let mut steps = self.step_runs.write();
        let step = steps
            .iter_mut()
            .find(|s| s.step_run_id == step_run_id)
            .ok_or_else(|| FlowgateError::NotFound(format!("step run {step_run_id}")))?;
        if step.status != RunStatus::Running {
            return Ok(false);
        }
        step.status = outcome.status;
        step.end_time = Some(outcome.end_time);
        step.rows_processed = outcome.rows_processed;
        step.error_message.clone_from(&outcome.error_message);
        Ok(true)
    }

    async fn step_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<StepRun>> {
        self.maybe_fail()?;
        Ok(self
            .step_runs
            .read()
            .iter()
            .filter(|s| s.pipeline_run_id == pipeline_run_id)
            .cloned()
            .collect())
    }
}
