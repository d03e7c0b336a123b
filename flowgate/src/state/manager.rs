//! Lock-free lifecycle management for scheduled runs.

use super::store::{CasResult, StateStore, TransitionPatch};
use super::transitions::is_valid_transition;
use crate::core::{scheduled_run_key, RunState, ScheduledRun};
use crate::errors::{ConfigError, FlowgateError, InvalidTransitionError, Result};
use crate::retry::{with_retry, RetryConfig};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Drives scheduled runs through their lifecycle.
///
/// Every transition is one conditional write; a `false` result means the
/// caller lost a race or the run already moved on, and no effect may be
/// assumed.
#[derive(Clone)]
pub struct PipelineStateManager {
    store: Arc<dyn StateStore>,
    retry: RetryConfig,
    max_retries: u32,
}

impl PipelineStateManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, retry: RetryConfig, max_retries: u32) -> Self {
        Self {
            store,
            retry,
            max_retries,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Inserts a `SCHEDULED` run and returns its id.
    ///
    /// The id is derived from the arguments, so scheduling the same slot
    /// twice returns the same id and leaves the first row untouched.
    #[instrument(skip(self), fields(run_id))]
    pub async fn create_scheduled_run(
        &self,
        tenant_id: &str,
        config_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Result<String> {
        for (field, value) in [("tenant_id", tenant_id), ("config_id", config_id)] {
            if value.trim().is_empty() {
                return Err(ConfigError::new(format!("{field} cannot be empty"))
                    .with_field(field)
                    .into());
            }
        }

        let run_id = scheduled_run_key(tenant_id, config_id, scheduled_time);
        tracing::Span::current().record("run_id", run_id.as_str());
        let run = ScheduledRun::new(&run_id, tenant_id, config_id, scheduled_time);

        let inserted = with_retry(&self.retry, "state.insert", || self.store.insert_if_absent(&run)).await?;
        if inserted {
            info!("scheduled run created");
        } else {
            debug!("scheduled run already exists");
        }
        Ok(run_id)
    }

    /// Moves `run_id` from `from` to `to`, merging `metadata`.
    ///
    /// Pairs outside the transition table fail with
    /// [`FlowgateError::InvalidTransition`](crate::errors::FlowgateError::InvalidTransition)
    /// before anything is written.
    pub async fn transition_state(
        &self,
        run_id: &str,
        from: RunState,
        to: RunState,
        metadata: HashMap<String, Value>,
    ) -> Result<bool> {
        self.transition_with(run_id, from, to, TransitionPatch::with_metadata(metadata))
            .await
    }

    #[instrument(skip(self, patch), fields(run_id = %run_id, from = %from, to = %to))]
    async fn transition_with(
        &self,
        run_id: &str,
        from: RunState,
        to: RunState,
        patch: TransitionPatch,
    ) -> Result<bool> {
        if !is_valid_transition(from, to) {
            return Err(InvalidTransitionError { from, to }.into());
        }

        let outcome = with_retry(&self.retry, "state.transition", || {
            self.store.compare_and_set(run_id, from, to, &patch)
        })
        .await?;

        match outcome {
            CasResult::Applied => {
                debug!("transition applied");
                Ok(true)
            }
            CasResult::NotFound => {
                warn!("transition on unknown run");
                Ok(false)
            }
            CasResult::StateMismatch { actual } => {
                debug!(actual = %actual, "transition lost: state diverged");
                Ok(false)
            }
        }
    }

    /// Runs due on `date`: `SCHEDULED` or `PENDING` with `scheduled_time <= now`.
    pub async fn get_due_runs(&self, date: NaiveDate) -> Result<Vec<ScheduledRun>> {
        with_retry(&self.retry, "state.due_runs", || {
            self.store.due_runs(date, Utc::now())
        })
        .await
    }

    /// Fetches one run.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<ScheduledRun>> {
        with_retry(&self.retry, "state.get", || self.store.get(run_id)).await
    }

    /// Runs currently in `state` for `tenant_id`.
    pub async fn runs_in_state(&self, tenant_id: &str, state: RunState) -> Result<Vec<ScheduledRun>> {
        with_retry(&self.retry, "state.runs_in_state", || {
            self.store.runs_in_state(Some(tenant_id), state)
        })
        .await
    }

    /// `SCHEDULED -> PENDING`: claims a due run for execution.
    pub async fn mark_as_pending(&self, run_id: &str) -> Result<bool> {
        self.transition_with(run_id, RunState::Scheduled, RunState::Pending, TransitionPatch::default())
            .await
    }

    /// `PENDING -> RUNNING`.
    pub async fn mark_as_running(&self, run_id: &str) -> Result<bool> {
        self.transition_with(run_id, RunState::Pending, RunState::Running, TransitionPatch::default())
            .await
    }

    /// `RUNNING -> COMPLETED`, clearing any earlier error.
    pub async fn mark_as_completed(&self, run_id: &str, metadata: HashMap<String, Value>) -> Result<bool> {
        let patch = TransitionPatch {
            metadata,
            clear_error: true,
            ..TransitionPatch::default()
        };
        self.transition_with(run_id, RunState::Running, RunState::Completed, patch)
            .await
    }

    /// `RUNNING -> PENDING` when `should_retry`, else `RUNNING -> FAILED`.
    ///
    /// `retry_count` is incremented in the same write.
    pub async fn mark_as_failed(&self, run_id: &str, error: &str, should_retry: bool) -> Result<bool> {
        let target = if should_retry {
            RunState::Pending
        } else {
            RunState::Failed
        };
        let patch = TransitionPatch {
            error_message: Some(error.to_string()),
            increment_retry: true,
            ..TransitionPatch::default()
        };
        self.transition_with(run_id, RunState::Running, target, patch).await
    }

    /// Returns true while `run` has retries left.
    #[must_use]
    pub fn should_retry(&self, run: &ScheduledRun) -> bool {
        run.retry_count < self.max_retries
    }

    /// Refreshes the heartbeat of a `RUNNING` run.
    pub async fn heartbeat(&self, run_id: &str) -> Result<bool> {
        with_retry(&self.retry, "state.heartbeat", || {
            self.store.touch(run_id, RunState::Running)
        })
        .await
    }

    /// Fails or requeues `RUNNING` runs with no heartbeat for `older_than`.
    ///
    /// Returns the ids that this call recovered; runs recovered
    /// concurrently by another worker are skipped.
    #[instrument(skip(self))]
    pub async fn recover_stale_runs(&self, older_than: Duration) -> Result<Vec<String>> {
        let threshold = chrono::Duration::from_std(older_than)
            .map_err(|e| FlowgateError::config(format!("invalid staleness threshold: {e}")))?;
        let before = Utc::now() - threshold;
        let stale = with_retry(&self.retry, "state.stale_runs", || {
            self.store.stale_runs(RunState::Running, before)
        })
        .await?;

        let mut recovered = Vec::new();
        for run in stale {
            let retry = self.should_retry(&run);
            let message = format!("stale heartbeat: no update since {}", run.updated_at.to_rfc3339());
            if self.mark_as_failed(&run.run_id, &message, retry).await? {
                warn!(run_id = %run.run_id, tenant_id = %run.tenant_id, requeued = retry, "recovered stale run");
                recovered.push(run.run_id);
            }
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for PipelineStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStateManager")
            .field("retry", &self.retry)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
