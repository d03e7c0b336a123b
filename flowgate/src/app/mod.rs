//! The application context.
//!
//! Every shared client is built once here and handed to the components
//! that need it; nothing in the crate reaches for a process-wide global.

use crate::collaborators::{NoOpNotifier, Notifier, SecretProvider, StaticSecretProvider};
use crate::config::FlowgateConfig;
use crate::errors::Result;
use crate::events::{EventSink, LoggingEventSink};
use crate::partition::PartitionedQueryExecutor;
use crate::pipeline::{
    register_builtin, DefinitionSource, ExecutorDeps, MemorySource, PartitionedQueryEngine,
    PipelineExecutor, PipelineLoader,
};
use crate::quota::{MemoryQuotaStore, QuotaEnforcer, QuotaStore};
use crate::registry::{EngineRegistry, StepEngine};
use crate::runs::{MemoryRunLog, RunLogStore};
use crate::state::{MemoryStateStore, PipelineStateManager, StateStore};
use crate::warehouse::{MemoryWarehouse, Warehouse};
use crate::worker::RunWorkerPool;
use crate::writer::IdempotentWriter;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Storage and collaborator implementations the engine runs against.
#[derive(Clone)]
pub struct Backends {
    /// Scheduled-run rows.
    pub state: Arc<dyn StateStore>,
    /// Pipeline-run and step-run rows.
    pub run_log: Arc<dyn RunLogStore>,
    /// Quota counters.
    pub quota: Arc<dyn QuotaStore>,
    /// The analytical warehouse.
    pub warehouse: Arc<dyn Warehouse>,
    /// Where pipeline definitions come from.
    pub definitions: Arc<dyn DefinitionSource>,
    /// Step credentials.
    pub secrets: Arc<dyn SecretProvider>,
    /// Tenant notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Audit events.
    pub events: Arc<dyn EventSink>,
}

impl Backends {
    /// In-process backends; definitions come from `definitions`.
    #[must_use]
    pub fn in_memory(definitions: Arc<dyn DefinitionSource>) -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            run_log: Arc::new(MemoryRunLog::new()),
            quota: Arc::new(MemoryQuotaStore::new()),
            warehouse: Arc::new(MemoryWarehouse::new()),
            definitions,
            secrets: Arc::new(StaticSecretProvider::new()),
            notifier: Arc::new(NoOpNotifier),
            events: Arc::new(LoggingEventSink::default()),
        }
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self::in_memory(Arc::new(MemorySource::new()))
    }
}

/// Everything a worker process needs, wired once at startup.
#[derive(Clone)]
pub struct AppContext {
    /// Validated configuration.
    pub config: Arc<FlowgateConfig>,
    /// Step engines by type.
    pub registry: Arc<EngineRegistry>,
    /// Scheduled-run state machine.
    pub state: PipelineStateManager,
    /// Admission control.
    pub quota: QuotaEnforcer,
    /// Run log.
    pub run_log: Arc<dyn RunLogStore>,
    /// The warehouse.
    pub warehouse: Arc<dyn Warehouse>,
    /// Idempotent writes.
    pub writer: IdempotentWriter,
    /// Partition fan-out.
    pub partitions: PartitionedQueryExecutor,
    /// The orchestrator.
    pub executor: PipelineExecutor,
    /// The scheduled-run pool.
    pub worker: RunWorkerPool,
}

impl AppContext {
    /// Validates `config` and wires the engine over `backends`.
    ///
    /// The built-in `noop` and `partitioned_query` engines are registered;
    /// add others with [`AppContext::register_engine`].
    pub fn new(config: FlowgateConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let retry = config.retry.clone();
        let registry = Arc::new(EngineRegistry::new());
        let state = PipelineStateManager::new(backends.state, retry.clone(), config.state.max_retries);
        let quota = QuotaEnforcer::new(backends.quota, config.quota.limits(), retry.clone());
        let writer = IdempotentWriter::new(
            backends.warehouse.clone(),
            retry.clone(),
            config.writer.merge_batch_size,
        );
        let partitions = PartitionedQueryExecutor::new(
            backends.warehouse.clone(),
            retry.clone(),
            config.timeouts.warehouse_timeout(),
        );
        register_builtin(
            &registry,
            PartitionedQueryEngine::new(
                partitions.clone(),
                config.partition.batch_size,
                config.timeouts.grace_period(),
            ),
        );

        let executor = PipelineExecutor::new(ExecutorDeps {
            loader: PipelineLoader::new(backends.definitions, registry.clone()),
            registry: registry.clone(),
            state: state.clone(),
            quota: quota.clone(),
            run_log: backends.run_log.clone(),
            warehouse: backends.warehouse.clone(),
            writer: writer.clone(),
            secrets: backends.secrets,
            notifier: backends.notifier,
            events: backends.events,
            retry,
            timeouts: config.timeouts.clone(),
        });
        let worker = RunWorkerPool::new(
            executor.clone(),
            config.worker.max_concurrent_runs,
            config.worker.poll_interval(),
            Duration::from_secs(config.state.stale_after_secs),
        );

        info!(
            engines = ?registry.step_types(),
            max_concurrent_runs = config.worker.max_concurrent_runs,
            "application context ready"
        );
        Ok(Self {
            config: Arc::new(config),
            registry,
            state,
            quota,
            run_log: backends.run_log,
            warehouse: backends.warehouse,
            writer,
            partitions,
            executor,
            worker,
        })
    }

    /// Configuration from the environment over in-memory backends.
    pub fn from_env(definitions: Arc<dyn DefinitionSource>) -> Result<Self> {
        Self::new(FlowgateConfig::from_env()?, Backends::in_memory(definitions))
    }

    /// Registers an engine for `step_type`.
    pub fn register_engine(&self, step_type: impl Into<String>, engine: Arc<dyn StepEngine>) {
        self.registry.register(step_type, engine);
    }

    /// Cancels every in-flight run.
    pub fn shutdown(&self, reason: &str) {
        info!(reason, active = self.executor.active_runs().len(), "shutting down");
        self.executor.shutdown(reason);
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FlowgateError;
    use crate::pipeline::{PipelineDefinition, StepDefinition, TriggerRequest, NOOP, PARTITIONED_QUERY};

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = FlowgateConfig::default();
        config.worker.max_concurrent_runs = 0;
        let err = AppContext::new(config, Backends::default()).unwrap_err();
        assert!(matches!(err, FlowgateError::Config(_)));
    }

    #[test]
    fn test_registers_builtin_engines() {
        let app = AppContext::new(FlowgateConfig::default(), Backends::default()).unwrap();
        assert!(app.registry.contains(NOOP));
        assert!(app.registry.contains(PARTITIONED_QUERY));
        assert_eq!(app.worker.available_slots(), FlowgateConfig::default().worker.max_concurrent_runs);
    }

    #[tokio::test]
    async fn test_trigger_through_context() {
        let source = Arc::new(MemorySource::new());
        source
            .insert(&PipelineDefinition::new("hello", vec![StepDefinition::new("a", NOOP)]))
            .unwrap();
        let app = AppContext::new(FlowgateConfig::default(), Backends::in_memory(source)).unwrap();

        let summary = app.executor.trigger(TriggerRequest::new("acme", "hello")).await.unwrap();

        assert!(summary.is_success());
        let run = app.run_log.get_pipeline_run(summary.pipeline_run_id).await.unwrap().unwrap();
        assert_eq!(run.tenant_id, "acme");
    }
}
