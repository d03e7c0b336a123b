//! Error types for the flowgate orchestration engine.
//!
//! Every failure surfaced by the engine maps onto one [`ErrorKind`], so
//! callers can decide between retrying, re-reading state, or giving up
//! without matching on individual variants.

use crate::core::RunState;
use crate::quota::LimitKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowgateError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed pipeline/step definition or misuse of an API.
    Config,
    /// Quota exceeded at admission time.
    AdmissionDenied,
    /// Storage failure that is worth retrying.
    TransientStorage,
    /// Storage failure that will not go away on retry.
    Storage,
    /// An optimistic write lost a race.
    StateConflict,
    /// A step engine reported failure.
    StepExecution,
    /// A partition task failed.
    Partition,
    /// A bounded duration was exceeded.
    Timeout,
    /// Work was cancelled before completion.
    Cancelled,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::AdmissionDenied => "admission_denied",
            Self::TransientStorage => "transient_storage",
            Self::Storage => "storage",
            Self::StateConflict => "state_conflict",
            Self::StepExecution => "step_execution",
            Self::Partition => "partition",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The main error type for flowgate operations.
#[derive(Debug, Error)]
pub enum FlowgateError {
    /// A pipeline or configuration validation error.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A state transition outside the transition table was requested.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Quota admission denied the run.
    #[error("admission denied for tenant '{tenant_id}': {limit} limit reached ({current}/{limit_value})")]
    AdmissionDenied {
        /// The tenant that was denied.
        tenant_id: String,
        /// Which limit was hit.
        limit: LimitKind,
        /// Current counter value.
        current: u64,
        /// Configured limit.
        limit_value: u64,
    },

    /// A retryable storage failure.
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// A permanent storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// An optimistic write lost a race.
    #[error("{0}")]
    StateConflict(#[from] StateConflictError),

    /// A step engine failed.
    #[error("step '{step_id}' failed: {message}")]
    StepExecution {
        /// The failing step.
        step_id: String,
        /// The engine's error message.
        message: String,
    },

    /// A partition task failed.
    #[error("{0}")]
    Partition(#[from] PartitionError),

    /// An operation exceeded its bounded duration.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// What was being done.
        operation: String,
        /// The bound that was exceeded.
        timeout_ms: u64,
    },

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for FlowgateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl FlowgateError {
    /// Creates a config error from a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ConfigError::new(message))
    }

    /// Creates a transient storage error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientStorage(message.into())
    }

    /// Creates a permanent storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a step execution error.
    #[must_use]
    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::InvalidTransition(_) => ErrorKind::Config,
            Self::AdmissionDenied { .. } => ErrorKind::AdmissionDenied,
            Self::TransientStorage(_) => ErrorKind::TransientStorage,
            Self::Storage(_) | Self::NotFound(_) | Self::Io(_) => ErrorKind::Storage,
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::StepExecution { .. } => ErrorKind::StepExecution,
            Self::Partition(_) => ErrorKind::Partition,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }

    /// Converts to a structured representation for run records and logs.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::AdmissionDenied { tenant_id, limit, .. } => {
                map.insert("tenant_id".to_string(), serde_json::json!(tenant_id));
                map.insert("limit".to_string(), serde_json::json!(limit));
            }
            Self::StepExecution { step_id, .. } => {
                map.insert("step_id".to_string(), serde_json::json!(step_id));
            }
            Self::Partition(err) => {
                map.insert("batch_index".to_string(), serde_json::json!(err.batch_index));
                map.insert("partition".to_string(), serde_json::json!(err.partition));
            }
            Self::Config(err) => {
                if let Some(ref field) = err.field {
                    map.insert("field".to_string(), serde_json::json!(field));
                }
            }
            _ => {}
        }

        map
    }
}

/// Error raised when a pipeline definition or configuration is malformed.
///
/// Always raised before any side effect takes place.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The offending field, if known.
    pub field: Option<String>,
    /// The steps involved.
    pub steps: Vec<String>,
}

impl ConfigError {
    /// Creates a new config error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
            steps: Vec::new(),
        }
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Adds an involved step.
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.steps.push(step_id.into());
        self
    }
}

/// Error raised when a transition is not in the transition table.
#[derive(Debug, Clone, Error)]
#[error("invalid state transition: {from} -> {to}")]
pub struct InvalidTransitionError {
    /// The source state.
    pub from: RunState,
    /// The requested target state.
    pub to: RunState,
}

/// Error raised when an optimistic write finds a different state than expected.
#[derive(Debug, Clone, Error)]
#[error("state conflict on run '{run_id}': expected {expected}, found {}", actual.map_or_else(|| "nothing".to_string(), |s| s.to_string()))]
pub struct StateConflictError {
    /// The run being transitioned.
    pub run_id: String,
    /// The state the caller expected.
    pub expected: RunState,
    /// The state actually stored, if the row exists.
    pub actual: Option<RunState>,
}

/// Error raised when one partition of a fan-out fails.
///
/// Batches before `batch_index` are committed and remain valid.
#[derive(Debug, Clone, Error)]
#[error("partition '{partition}' failed in batch {batch_index}: {message}")]
pub struct PartitionError {
    /// Index of the batch that aborted.
    pub batch_index: usize,
    /// The failing partition value.
    pub partition: String,
    /// Number of batches fully committed before the failure.
    pub committed_batches: usize,
    /// Rows written by committed batches.
    pub rows_written: u64,
    /// Bytes processed by committed batches.
    pub bytes_processed: u64,
    /// The underlying failure.
    pub message: String,
}
