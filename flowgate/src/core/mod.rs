//! Core domain model types for flowgate.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Run state and status enums
//! - Persisted run, step and quota records
//! - Lineage keys and identifier helpers

mod ids;
mod lineage;
mod records;
mod status;

pub use ids::{new_run_id, scheduled_run_key};
pub use lineage::{
    LineageKey, CREDENTIAL_ID_COLUMN, INGESTED_AT_COLUMN, LINEAGE_COLUMNS, PIPELINE_ID_COLUMN,
    RUN_DATE_COLUMN, RUN_ID_COLUMN, TENANT_ID_COLUMN,
};
pub use records::{PipelineRun, QuotaRecord, ScheduledRun, StepRun};
pub use status::{RunState, RunStatus, TriggerType};
