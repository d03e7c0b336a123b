//! Audit events.
//!
//! Run and step lifecycle events are emitted to an [`EventSink`]. Emission
//! is best-effort: a sink must never fail the run that emits into it.

mod sink;

pub use sink::{AuditEvent, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run started executing.
pub const RUN_STARTED: &str = "run.started";
/// A run finished successfully.
pub const RUN_COMPLETED: &str = "run.completed";
/// A run finished with a failure.
pub const RUN_FAILED: &str = "run.failed";
/// A run was refused by quota admission.
pub const RUN_DENIED: &str = "run.denied";
/// An abandoned run was recovered.
pub const RUN_RECOVERED: &str = "run.recovered";
/// A step started.
pub const STEP_STARTED: &str = "step.started";
/// A step finished successfully.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step failed.
pub const STEP_FAILED: &str = "step.failed";
