//! A fully wired engine over in-memory backends.

use std::sync::Arc;

use chrono::Utc;

use crate::app::{AppContext, Backends};
use crate::collaborators::{RecordingNotifier, StaticSecretProvider};
use crate::config::FlowgateConfig;
use crate::core::{PipelineRun, StepRun};
use crate::events::CollectingEventSink;
use crate::pipeline::{MemorySource, PipelineDefinition};
use crate::quota::{MemoryQuotaStore, QuotaLimits};
use crate::retry::{JitterStrategy, RetryConfig};
use crate::runs::{MemoryRunLog, RunLogStore};
use crate::state::MemoryStateStore;
use crate::testing::mocks::{
    CountingEngine, FailingEngine, PanickingEngine, RecordingEngine, RowWritingEngine,
};
use crate::warehouse::MemoryWarehouse;

/// Retries fast enough for tests.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(4)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(JitterStrategy::None)
}

/// Default configuration with fast retries.
#[must_use]
pub fn test_config() -> FlowgateConfig {
    FlowgateConfig {
        retry: fast_retry(),
        ..FlowgateConfig::default()
    }
}

/// An [`AppContext`] plus typed handles on its in-memory backends.
///
/// Registers `count`, `fail`, `panic`, `record` and `write` engines in
/// addition to the built-ins.
pub struct TestHarness {
    /// The wired engine.
    pub app: AppContext,
    /// Warehouse rows and fault injection.
    pub warehouse: Arc<MemoryWarehouse>,
    /// Pipeline-run and step-run rows.
    pub run_log: Arc<MemoryRunLog>,
    /// Scheduled-run rows.
    pub state_store: Arc<MemoryStateStore>,
    /// Quota rows.
    pub quota_store: Arc<MemoryQuotaStore>,
    /// Pipeline definitions.
    pub definitions: Arc<MemorySource>,
    /// Credentials.
    pub secrets: Arc<StaticSecretProvider>,
    /// Delivered notifications.
    pub notifier: Arc<RecordingNotifier>,
    /// Emitted audit events.
    pub events: Arc<CollectingEventSink>,
    /// The `count` engine.
    pub counter: Arc<CountingEngine>,
    /// The `record` engine.
    pub recorder: Arc<RecordingEngine>,
}

impl TestHarness {
    /// A harness with [`test_config`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config(), |_| {})
    }

    /// A harness with `config`; `customize` may swap backends before wiring.
    #[must_use]
    pub fn with_config(config: FlowgateConfig, customize: impl FnOnce(&mut Backends)) -> Self {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let run_log = Arc::new(MemoryRunLog::new());
        let state_store = Arc::new(MemoryStateStore::new());
        let quota_store = Arc::new(MemoryQuotaStore::new());
        let definitions = Arc::new(MemorySource::new());
        let secrets = Arc::new(StaticSecretProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let events = Arc::new(CollectingEventSink::new());

        let mut backends = Backends {
            state: state_store.clone(),
            run_log: run_log.clone(),
            quota: quota_store.clone(),
            warehouse: warehouse.clone(),
            definitions: definitions.clone(),
            secrets: secrets.clone(),
            notifier: notifier.clone(),
            events: events.clone(),
        };
        customize(&mut backends);

        let app = AppContext::new(config, backends).expect("test configuration is valid");
        let counter = Arc::new(CountingEngine::new(10));
        let recorder = Arc::new(RecordingEngine::new());
        app.register_engine("count", counter.clone());
        app.register_engine("record", recorder.clone());
        app.register_engine("fail", Arc::new(FailingEngine::new("step exploded")));
        app.register_engine("panic", Arc::new(PanickingEngine::new("engine bug")));
        app.register_engine("write", Arc::new(RowWritingEngine));

        Self {
            app,
            warehouse,
            run_log,
            state_store,
            quota_store,
            definitions,
            secrets,
            notifier,
            events,
            counter,
            recorder,
        }
    }

    /// Makes `definition` loadable.
    pub fn define(&self, definition: &PipelineDefinition) {
        self.definitions
            .insert(definition)
            .expect("definition serializes");
    }

    /// Overrides a tenant's quota limits.
    pub fn set_limits(&self, tenant_id: &str, limits: QuotaLimits) {
        self.app.quota.set_tenant_limits(tenant_id, limits);
    }

    /// Every pipeline run for `tenant_id`.
    pub async fn pipeline_runs(&self, tenant_id: &str) -> Vec<PipelineRun> {
        self.run_log
            .pipeline_runs(tenant_id)
            .await
            .expect("memory run log")
    }

    /// Step runs of one pipeline run, in start order.
    pub async fn step_runs(&self, pipeline_run: &PipelineRun) -> Vec<StepRun> {
        self.run_log
            .step_runs(pipeline_run.pipeline_run_id)
            .await
            .expect("memory run log")
    }

    /// Concurrent slots `tenant_id` holds today.
    pub async fn concurrent_usage(&self, tenant_id: &str) -> u64 {
        self.app
            .quota
            .usage(tenant_id, Utc::now().date_naive())
            .await
            .expect("memory quota store")
            .map_or(0, |r| r.concurrent_count)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
