//! Persisted record types.

use super::{RunState, RunStatus, TriggerType};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A run created by a scheduler ahead of its due time.
///
/// Owned exclusively by state manager transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRun {
    /// Deterministic run key.
    pub run_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The pipeline configuration this run executes.
    pub config_id: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// When the run becomes due.
    pub scheduled_time: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Free-form metadata merged on every transition.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledRun {
    /// Creates a new run in the `SCHEDULED` state.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        tenant_id: impl Into<String>,
        config_id: impl Into<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            tenant_id: tenant_id.into(),
            config_id: config_id.into(),
            state: RunState::Scheduled,
            scheduled_time,
            retry_count: 0,
            error_message: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The calendar date the run is scheduled for.
    #[must_use]
    pub fn scheduled_date(&self) -> NaiveDate {
        self.scheduled_time.date_naive()
    }

    /// Returns true if the run is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_due_candidate() && self.scheduled_time <= now
    }
}

/// One invocation of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique id of the invocation.
    pub pipeline_run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// The pipeline that ran.
    pub pipeline_id: String,
    /// Current status.
    pub status: RunStatus,
    /// When the invocation started.
    pub start_time: DateTime<Utc>,
    /// When the invocation finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// How the run was started.
    pub trigger_type: TriggerType,
    /// Who or what started it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_by: Option<String>,
    /// Parameters supplied at trigger time.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Failure reason when `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// The scheduled run this invocation belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_run_id: Option<String>,
}

impl PipelineRun {
    /// Creates a new `RUNNING` pipeline run record.
    #[must_use]
    pub fn start(
        pipeline_run_id: Uuid,
        tenant_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        trigger_type: TriggerType,
    ) -> Self {
        Self {
            pipeline_run_id,
            tenant_id: tenant_id.into(),
            pipeline_id: pipeline_id.into(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            trigger_type,
            trigger_by: None,
            parameters: HashMap::new(),
            error_message: None,
            scheduled_run_id: None,
        }
    }

    /// Duration in milliseconds, if finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// One execution attempt of one step.
///
/// Append-only; the end fields are filled exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRun {
    /// Unique id of the attempt.
    pub step_run_id: Uuid,
    /// The owning pipeline run.
    pub pipeline_run_id: Uuid,
    /// The step that ran.
    pub step_id: String,
    /// Current status.
    pub status: RunStatus,
    /// When the attempt started.
    pub start_time: DateTime<Utc>,
    /// When the attempt finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Rows reported by the engine.
    pub rows_processed: u64,
    /// Failure reason when `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepRun {
    /// Creates a new `RUNNING` step run record.
    #[must_use]
    pub fn start(step_run_id: Uuid, pipeline_run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            step_run_id,
            pipeline_run_id,
            step_id: step_id.into(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            rows_processed: 0,
            error_message: None,
        }
    }
}

/// Per-tenant, per-date usage counters and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Owning tenant.
    pub tenant_id: String,
    /// The usage date this row counts.
    pub usage_date: NaiveDate,
    /// Runs admitted on `usage_date`.
    pub daily_count: u64,
    /// Runs admitted in the calendar month of `usage_date`.
    pub monthly_count: u64,
    /// Runs currently holding a concurrency slot.
    pub concurrent_count: u64,
    /// Daily limit.
    pub daily_limit: u64,
    /// Monthly limit.
    pub monthly_limit: u64,
    /// Concurrency limit.
    pub concurrent_limit: u64,
}
