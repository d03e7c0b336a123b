//! # Flowgate
//!
//! Multi-tenant pipeline orchestration over an analytical warehouse.
//!
//! Flowgate provides:
//!
//! - **Scheduled-run state machine**: lock-free compare-and-swap transitions
//! - **Orchestration**: sequential steps with guaranteed run records
//! - **Idempotent writes**: lineage-tagged dedup and batched merge
//! - **Partitioned execution**: bounded fan-out with resumable batches
//! - **Admission control**: per-tenant daily, monthly and concurrent quotas
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgate::prelude::*;
//!
//! let app = AppContext::new(FlowgateConfig::from_env()?, Backends::default())?;
//! app.register_engine("load_orders", Arc::new(LoadOrders::new()));
//!
//! let summary = app
//!     .executor
//!     .trigger(TriggerRequest::new("acme", "orders_daily"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod app;
pub mod cancellation;
pub mod collaborators;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod partition;
pub mod pipeline;
pub mod quota;
pub mod registry;
pub mod retry;
pub mod runs;
pub mod state;
pub mod warehouse;
pub mod worker;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::app::{AppContext, Backends};
    pub use crate::cancellation::{CancellationToken, FinalizeGuard};
    pub use crate::config::FlowgateConfig;
    pub use crate::core::{
        LineageKey, PipelineRun, RunState, RunStatus, ScheduledRun, StepRun, TriggerType,
    };
    pub use crate::errors::{ErrorKind, FlowgateError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        ExecutionSummary, PipelineDefinition, PipelineExecutor, StepDefinition, TriggerRequest,
    };
    pub use crate::quota::{QuotaEnforcer, QuotaLimits};
    pub use crate::registry::{EngineRegistry, StepConfig, StepContext, StepEngine, StepResult};
    pub use crate::retry::RetryConfig;
    pub use crate::state::PipelineStateManager;
    pub use crate::warehouse::{Row, TableRef, Warehouse};
    pub use crate::worker::RunWorkerPool;
    pub use crate::writer::{IdempotentWriter, WriteMode};
    pub use std::sync::Arc;
}
