//! Persistence contract for scheduled runs.

use crate::core::{RunState, ScheduledRun};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Result of a compare-and-swap on a run's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Exactly one row matched and was updated.
    Applied,
    /// No row with that id.
    NotFound,
    /// The stored state differed from the expected one.
    StateMismatch {
        /// The state actually stored.
        actual: RunState,
    },
}

impl CasResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Fields written together with a state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPatch {
    /// Merged into the run's metadata.
    pub metadata: HashMap<String, Value>,
    /// Replaces the error message when set.
    pub error_message: Option<String>,
    /// Clears the error message.
    pub clear_error: bool,
    /// Increments `retry_count`.
    pub increment_retry: bool,
}

impl TransitionPatch {
    /// A patch that only merges metadata.
    #[must_use]
    pub fn with_metadata(metadata: HashMap<String, Value>) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    /// Applies the patch to `run`, stamping `updated_at`.
    pub fn apply(&self, run: &mut ScheduledRun, target: RunState, now: DateTime<Utc>) {
        run.state = target;
        run.updated_at = now;
        run.metadata
            .extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.clear_error {
            run.error_message = None;
        }
        if let Some(ref message) = self.error_message {
            run.error_message = Some(message.clone());
        }
        if self.increment_retry {
            run.retry_count += 1;
        }
    }
}

/// Storage for scheduled runs.
///
/// `compare_and_set` must be a single conditional write
/// (`UPDATE ... WHERE run_id = ? AND state = ?`) so that concurrent callers
/// attempting the same transition see exactly one `Applied`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Inserts `run` unless a row with its id exists. Returns true if inserted.
    async fn insert_if_absent(&self, run: &ScheduledRun) -> Result<bool>;

    /// Fetches a run by id.
    async fn get(&self, run_id: &str) -> Result<Option<ScheduledRun>>;

    /// Moves `run_id` from `expected` to `target` and applies `patch`,
    /// only if the stored state equals `expected`.
    async fn compare_and_set(
        &self,
        run_id: &str,
        expected: RunState,
        target: RunState,
        patch: &TransitionPatch,
    ) -> Result<CasResult>;

    /// Refreshes `updated_at` if the run is still in `expected`.
    async fn touch(&self, run_id: &str, expected: RunState) -> Result<bool>;

    /// Runs scheduled on `date` in `SCHEDULED` or `PENDING` whose
    /// `scheduled_time <= now`, oldest first.
    async fn due_runs(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<ScheduledRun>>;

    /// Runs in `state`, optionally restricted to one tenant.
    async fn runs_in_state(&self, tenant_id: Option<&str>, state: RunState) -> Result<Vec<ScheduledRun>>;

    /// Runs in `state` not updated since `before`.
    async fn stale_runs(&self, state: RunState, before: DateTime<Utc>) -> Result<Vec<ScheduledRun>>;
}
