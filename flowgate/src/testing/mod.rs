//! Testing utilities for flowgate.
//!
//! This module provides:
//! - Step engines with scripted behavior
//! - A harness wiring the engine over in-memory backends
//! - Assertions over run records and written rows

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_rows_tagged, assert_run_finished, assert_step_statuses};
pub use fixtures::{fast_retry, test_config, TestHarness};
pub use mocks::{
    numbered_rows, OverlapTrackingEngine, CountingEngine, FailingEngine, PanickingEngine,
    RecordingEngine, RowWritingEngine, SeenContext, SlowEngine,
};
