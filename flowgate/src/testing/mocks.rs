//! Step engines with scripted behavior.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::collaborators::CredentialHandle;
use crate::registry::{StepConfig, StepContext, StepEngine, StepResult};
use crate::warehouse::{Row, TableRef};
use crate::writer::WriteMode;

/// Succeeds with a fixed row count and counts its calls.
#[derive(Debug, Default)]
pub struct CountingEngine {
    rows: u64,
    calls: AtomicUsize,
}

impl CountingEngine {
    /// Creates an engine reporting `rows` rows per call.
    #[must_use]
    pub fn new(rows: u64) -> Self {
        Self {
            rows,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the engine was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepEngine for CountingEngine {
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StepResult::success(self.rows)
    }
}

/// Always reports failure.
#[derive(Debug)]
pub struct FailingEngine {
    message: String,
}

impl FailingEngine {
    /// Creates an engine failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl StepEngine for FailingEngine {
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        StepResult::failed(self.message.clone())
    }
}

/// Panics when executed.
#[derive(Debug)]
pub struct PanickingEngine {
    message: String,
}

impl PanickingEngine {
    /// Creates an engine panicking with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl StepEngine for PanickingEngine {
    #[allow(clippy::panic)]
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        panic!("{}", self.message);
    }
}

/// Sleeps before succeeding; ignores cancellation.
#[derive(Debug)]
pub struct SlowEngine {
    delay: Duration,
}

impl SlowEngine {
    /// Creates an engine sleeping for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl StepEngine for SlowEngine {
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        tokio::time::sleep(self.delay).await;
        StepResult::success(0)
    }
}

/// Tracks how many executions overlap.
#[derive(Debug)]
pub struct OverlapTrackingEngine {
    delay: Duration,
    in_flight: AtomicUsize,
    /// Highest overlap observed.
    pub peak: AtomicUsize,
}

impl OverlapTrackingEngine {
    /// Creates an engine holding each execution for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StepEngine for OverlapTrackingEngine {
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        StepResult::success(1)
    }
}

/// What a [`RecordingEngine`] saw.
#[derive(Debug, Clone)]
pub struct SeenContext {
    /// Step id.
    pub step_id: String,
    /// The config the engine received.
    pub config: StepConfig,
    /// Parameters from the context.
    pub parameters: std::collections::HashMap<String, Value>,
    /// The secret, if one could be read during the step.
    pub secret: Option<String>,
    /// The credential handle, kept to check it afterwards.
    pub credential: Option<CredentialHandle>,
}

/// Records every context it is called with.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    seen: Mutex<Vec<SeenContext>>,
}

impl RecordingEngine {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts seen so far.
    #[must_use]
    pub fn seen(&self) -> Vec<SeenContext> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl StepEngine for RecordingEngine {
    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepResult {
        self.seen.lock().push(SeenContext {
            step_id: ctx.step_id.clone(),
            config: config.clone(),
            parameters: ctx.parameters.clone(),
            secret: ctx.secret().ok(),
            credential: ctx.credential().cloned(),
        });
        StepResult::success(0)
    }
}

/// Writes generated rows through the context's writer.
///
/// Config keys: `target` (`dataset.table`), `rows`, `mode`
/// (`merge`/`dedup`), `credential_id`.
#[derive(Debug, Default)]
pub struct RowWritingEngine;

impl RowWritingEngine {
    async fn write(config: &StepConfig, ctx: &StepContext) -> crate::errors::Result<u64> {
        let target = TableRef::parse(config.get("target").and_then(Value::as_str).unwrap_or("mart.events"))?;
        let count = config.get("rows").and_then(Value::as_u64).unwrap_or(0);
        let mode: WriteMode = config
            .get("mode")
            .map(|m| serde_json::from_value(m.clone()))
            .transpose()?
            .unwrap_or_default();
        let credential_id = config
            .get("credential_id")
            .and_then(Value::as_str)
            .unwrap_or("default");

        let rows = numbered_rows(count);
        let key = ctx.lineage_key(credential_id);
        ctx.writer()
            .write(mode, &target, &key, &["id".to_string()], rows, &ctx.run_id())
            .await
    }
}

#[async_trait]
impl StepEngine for RowWritingEngine {
    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepResult {
        match Self::write(config, ctx).await {
            Ok(rows) => StepResult::success(rows),
            Err(e) => StepResult::from(e),
        }
    }
}

/// Rows `{"id": i, "value": "row-i"}` for `i` in `0..count`.
#[must_use]
pub fn numbered_rows(count: u64) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let mut row = Row::new();
            row.insert("id".to_string(), Value::from(i));
            row.insert("value".to_string(), Value::from(format!("row-{i}")));
            row
        })
        .collect()
}
