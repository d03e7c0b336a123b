//! The pipeline orchestrator.
//!
//! One invocation writes exactly one `PipelineRun` terminal record and one
//! `StepRun` start/end pair per executed step. Both end records are backed
//! by a [`FinalizeGuard`], so a panic or a dropped future still leaves
//! them terminal.

use super::definition::{PipelineDefinition, StepDefinition};
use super::loader::PipelineLoader;
use super::summary::{ExecutionSummary, StepSummary};
use crate::cancellation::{catch_panic, run_with_timeout, CancellationToken, FinalizeGuard};
use crate::collaborators::{notify_best_effort, CredentialHandle, Notifier, SecretProvider, Severity};
use crate::config::TimeoutConfig;
use crate::core::{new_run_id, PipelineRun, RunState, RunStatus, ScheduledRun, StepRun, TriggerType};
use crate::errors::{FlowgateError, Result, StateConflictError};
use crate::events::{self, AuditEvent, EventSink};
use crate::observability::{run_span, step_span, SpanTimer};
use crate::quota::QuotaEnforcer;
use crate::registry::{EngineRegistry, StepContext, StepResult};
use crate::retry::{with_retry, RetryConfig};
use crate::runs::{RunLogStore, RunOutcome};
use crate::state::PipelineStateManager;
use crate::warehouse::Warehouse;
use crate::writer::IdempotentWriter;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// A request to run a pipeline now.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Pipeline to run.
    pub pipeline_id: String,
    /// Trigger parameters.
    pub parameters: HashMap<String, Value>,
    /// How the run was started.
    pub trigger_type: TriggerType,
    /// Who started it.
    pub trigger_by: Option<String>,
    /// Logical run date; today when absent.
    pub run_date: Option<NaiveDate>,
}

impl TriggerRequest {
    /// An API trigger with no parameters.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pipeline_id: pipeline_id.into(),
            parameters: HashMap::new(),
            trigger_type: TriggerType::Api,
            trigger_by: None,
            run_date: None,
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Records who triggered the run.
    #[must_use]
    pub fn with_trigger_by(mut self, who: impl Into<String>) -> Self {
        self.trigger_by = Some(who.into());
        self
    }

    /// Sets the trigger type.
    #[must_use]
    pub fn with_trigger_type(mut self, trigger_type: TriggerType) -> Self {
        self.trigger_type = trigger_type;
        self
    }

    /// Sets the logical run date.
    #[must_use]
    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = Some(run_date);
        self
    }
}

/// Collaborators of a [`PipelineExecutor`].
#[derive(Clone)]
pub struct ExecutorDeps {
    /// Definition loader.
    pub loader: PipelineLoader,
    /// Step engines.
    pub registry: Arc<EngineRegistry>,
    /// Scheduled-run state machine.
    pub state: PipelineStateManager,
    /// Admission control.
    pub quota: QuotaEnforcer,
    /// Pipeline-run and step-run logs.
    pub run_log: Arc<dyn RunLogStore>,
    /// The warehouse handed to steps.
    pub warehouse: Arc<dyn Warehouse>,
    /// The writer handed to steps.
    pub writer: IdempotentWriter,
    /// Step credentials.
    pub secrets: Arc<dyn SecretProvider>,
    /// Tenant notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Audit events.
    pub events: Arc<dyn EventSink>,
    /// Retry policy for run-log writes.
    pub retry: RetryConfig,
    /// Step timeouts.
    pub timeouts: TimeoutConfig,
}

struct Invocation {
    tenant_id: String,
    parameters: HashMap<String, Value>,
    trigger_type: TriggerType,
    trigger_by: Option<String>,
    run_date: NaiveDate,
    scheduled_run_id: Option<String>,
}

impl Invocation {
    fn from_request(request: &TriggerRequest) -> Self {
        Self {
            tenant_id: request.tenant_id.clone(),
            parameters: request.parameters.clone(),
            trigger_type: request.trigger_type,
            trigger_by: request.trigger_by.clone(),
            run_date: request.run_date.unwrap_or_else(|| Utc::now().date_naive()),
            scheduled_run_id: None,
        }
    }
}

/// Loads pipelines and runs their steps in order.
#[derive(Clone)]
pub struct PipelineExecutor {
    deps: ExecutorDeps,
    active: Arc<DashMap<Uuid, Arc<CancellationToken>>>,
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(deps: ExecutorDeps) -> Self {
        Self {
            deps,
            active: Arc::new(DashMap::new()),
        }
    }

    /// The state manager.
    #[must_use]
    pub fn state(&self) -> &PipelineStateManager {
        &self.deps.state
    }

    /// The quota enforcer.
    #[must_use]
    pub fn quota(&self) -> &QuotaEnforcer {
        &self.deps.quota
    }

    /// The run log.
    #[must_use]
    pub fn run_log(&self) -> &Arc<dyn RunLogStore> {
        &self.deps.run_log
    }

    /// Loads and validates a definition.
    pub async fn load(
        &self,
        pipeline_id: &str,
        tenant_id: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<PipelineDefinition> {
        self.deps.loader.load(pipeline_id, tenant_id, parameters).await
    }

    /// Requests graceful cancellation of an in-flight run.
    ///
    /// Returns false if the run is not executing in this process.
    pub fn cancel_run(&self, pipeline_run_id: Uuid, reason: &str) -> bool {
        match self.active.get(&pipeline_run_id) {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Requests cancellation of every in-flight run.
    pub fn shutdown(&self, reason: &str) {
        for entry in self.active.iter() {
            entry.value().cancel(reason);
        }
    }

    /// Ids of runs currently executing in this process.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Runs an ad-hoc invocation: load, admit, execute, release.
    ///
    /// Fails with `ConfigError` before any side effect, or with
    /// `AdmissionDenied` naming the limit hit. A run that starts always
    /// returns a summary, failed or not.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<ExecutionSummary> {
        let definition = self
            .load(&request.pipeline_id, &request.tenant_id, &request.parameters)
            .await?;
        let permit = self.admit(&request.tenant_id, &request.pipeline_id).await?;

        let result = self.execute_invocation(&definition, Invocation::from_request(&request)).await;
        permit.release().await;
        result
    }

    /// Executes an already loaded definition without admission control.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        request: &TriggerRequest,
    ) -> Result<ExecutionSummary> {
        self.execute_invocation(definition, Invocation::from_request(request))
            .await
    }

    /// Drives a scheduled run to a terminal or retryable state.
    ///
    /// A `SCHEDULED` run is claimed first. Admission denial leaves the run
    /// `PENDING` for the next sweep; failures go back to `PENDING` while
    /// retries remain.
    pub async fn run_scheduled(&self, run_id: &str) -> Result<ExecutionSummary> {
        let run = self
            .deps
            .state
            .get_run(run_id)
            .await?
            .ok_or_else(|| FlowgateError::NotFound(format!("scheduled run '{run_id}'")))?;

        match run.state {
            RunState::Scheduled => {
                if !self.deps.state.mark_as_pending(run_id).await? {
                    return Err(self.conflict(run_id, RunState::Scheduled).await);
                }
            }
            RunState::Pending => {}
            other => {
                return Err(StateConflictError {
                    run_id: run_id.to_string(),
                    expected: RunState::Pending,
                    actual: Some(other),
                }
                .into())
            }
        }

        let parameters: HashMap<String, Value> = run
            .metadata
            .get("parameters")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let definition = match self.load(&run.config_id, &run.tenant_id, &parameters).await {
            Ok(definition) => definition,
            Err(e) => {
                self.fail_unloadable(&run, &e).await;
                return Err(e);
            }
        };

        let permit = self.admit(&run.tenant_id, &run.config_id).await?;

        if !self.deps.state.mark_as_running(run_id).await? {
            permit.release().await;
            return Err(self.conflict(run_id, RunState::Pending).await);
        }

        let invocation = Invocation {
            tenant_id: run.tenant_id.clone(),
            parameters,
            trigger_type: TriggerType::Scheduled,
            trigger_by: Some("scheduler".to_string()),
            run_date: run.scheduled_date(),
            scheduled_run_id: Some(run_id.to_string()),
        };
        let result = self.execute_invocation(&definition, invocation).await;

        let settled = match &result {
            Ok(summary) if summary.is_success() => {
                let metadata = HashMap::from([
                    ("pipeline_run_id".to_string(), json!(summary.pipeline_run_id)),
                    ("rows_processed".to_string(), json!(summary.rows_processed())),
                ]);
                self.deps.state.mark_as_completed(run_id, metadata).await
            }
            Ok(summary) => {
                let reason = summary.error_message.as_deref().unwrap_or("pipeline failed");
                self.deps
                    .state
                    .mark_as_failed(run_id, reason, self.deps.state.should_retry(&run))
                    .await
            }
            Err(e) => {
                self.deps
                    .state
                    .mark_as_failed(run_id, &e.to_string(), self.deps.state.should_retry(&run))
                    .await
            }
        };
        permit.release().await;

        match settled {
            Ok(true) => {}
            Ok(false) => warn!(run_id, "Scheduled run changed state during execution"),
            Err(e) => error!(run_id, error = %e, "Failed to settle scheduled run"),
        }
        result
    }

    async fn admit(&self, tenant_id: &str, pipeline_id: &str) -> Result<crate::quota::QuotaPermit> {
        match self.deps.quota.admit(tenant_id).await {
            Ok(permit) => Ok(permit),
            Err(e) => {
                self.deps
                    .events
                    .emit(AuditEvent::new(
                        events::RUN_DENIED,
                        tenant_id,
                        "",
                        json!({"pipeline_id": pipeline_id, "error": e.to_dict()}),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    async fn conflict(&self, run_id: &str, expected: RunState) -> FlowgateError {
        let actual = self
            .deps
            .state
            .get_run(run_id)
            .await
            .ok()
            .flatten()
            .map(|r| r.state);
        StateConflictError {
            run_id: run_id.to_string(),
            expected,
            actual,
        }
        .into()
    }

    /// A run whose definition cannot be loaded fails terminally.
    async fn fail_unloadable(&self, run: &ScheduledRun, err: &FlowgateError) {
        let outcome = async {
            if self.deps.state.mark_as_running(&run.run_id).await? {
                self.deps
                    .state
                    .mark_as_failed(&run.run_id, &err.to_string(), false)
                    .await?;
            }
            Ok::<_, FlowgateError>(())
        }
        .await;
        if let Err(e) = outcome {
            error!(run_id = %run.run_id, error = %e, "Failed to record unloadable run");
        }
    }

    async fn execute_invocation(
        &self,
        definition: &PipelineDefinition,
        invocation: Invocation,
    ) -> Result<ExecutionSummary> {
        let pipeline_run_id = new_run_id();
        let span = run_span(
            &invocation.tenant_id,
            &definition.pipeline_id,
            &pipeline_run_id.to_string(),
        );
        self.run_pipeline(definition, invocation, pipeline_run_id)
            .instrument(span)
            .await
    }

    async fn run_pipeline(
        &self,
        definition: &PipelineDefinition,
        invocation: Invocation,
        pipeline_run_id: Uuid,
    ) -> Result<ExecutionSummary> {
        let timer = SpanTimer::start();
        let tenant_id = invocation.tenant_id.clone();

        let mut parameters = definition.parameters.clone();
        parameters.extend(invocation.parameters.clone());

        let mut record = PipelineRun::start(
            pipeline_run_id,
            &tenant_id,
            &definition.pipeline_id,
            invocation.trigger_type,
        );
        record.trigger_by = invocation.trigger_by.clone();
        record.parameters = parameters.clone();
        record.scheduled_run_id = invocation.scheduled_run_id.clone();

        with_retry(&self.deps.retry, "runs.insert_pipeline_run", || {
            self.deps.run_log.insert_pipeline_run(&record)
        })
        .await?;

        let guard = self.finalize_guard("pipeline_run", pipeline_run_id, FinalizeTarget::Pipeline);
        let token = Arc::new(CancellationToken::new());
        self.active.insert(pipeline_run_id, token.clone());

        info!(steps = definition.steps.len(), trigger = %invocation.trigger_type, "Pipeline run started");
        self.emit(events::RUN_STARTED, &tenant_id, pipeline_run_id, json!({
            "pipeline_id": definition.pipeline_id,
            "trigger_type": invocation.trigger_type,
        }))
        .await;

        let mut steps = Vec::with_capacity(definition.steps.len());
        let mut failure: Option<String> = None;
        for step in &definition.steps {
            if let Err(e) = token.check() {
                failure = Some(e.to_string());
                break;
            }

            let summary = self
                .run_step(step, definition, &invocation, &parameters, pipeline_run_id, &token)
                .instrument(step_span(&step.step_id, &step.step_type))
                .await;
            let failed = summary.status == RunStatus::Failed;
            let message = summary.error.clone();
            steps.push(summary);

            if let Some(scheduled) = &invocation.scheduled_run_id {
                if let Err(e) = self.deps.state.heartbeat(scheduled).await {
                    warn!(run_id = %scheduled, error = %e, "Heartbeat failed");
                }
            }

            if failed {
                if step.optional {
                    warn!(step_id = %step.step_id, "Optional step failed; continuing");
                } else {
                    failure = Some(format!(
                        "step '{}' failed: {}",
                        step.step_id,
                        message.unwrap_or_else(|| "unknown error".to_string())
                    ));
                    break;
                }
            }
        }
        self.active.remove(&pipeline_run_id);

        let outcome = match &failure {
            None => RunOutcome::completed(
                steps
                    .iter()
                    .filter(|s| s.status == RunStatus::Completed)
                    .map(|s| s.rows_processed)
                    .sum(),
            ),
            Some(reason) => RunOutcome::failed(reason.clone()),
        };
        self.finalize_pipeline(guard, pipeline_run_id, &outcome).await;

        let summary = ExecutionSummary {
            pipeline_run_id,
            tenant_id: tenant_id.clone(),
            pipeline_id: definition.pipeline_id.clone(),
            status: outcome.status,
            steps,
            error_message: failure,
            duration_ms: timer.elapsed_ms(),
        };
        self.announce(&summary).await;
        Ok(summary)
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        definition: &PipelineDefinition,
        invocation: &Invocation,
        parameters: &HashMap<String, Value>,
        pipeline_run_id: Uuid,
        token: &Arc<CancellationToken>,
    ) -> StepSummary {
        let timer = SpanTimer::start();
        let step_run_id = new_run_id();
        let tenant_id = invocation.tenant_id.as_str();

        let started = StepRun::start(step_run_id, pipeline_run_id, &step.step_id);
        if let Err(e) = with_retry(&self.deps.retry, "runs.insert_step_run", || {
            self.deps.run_log.insert_step_run(&started)
        })
        .await
        {
            error!(error = %e, "Could not record step start");
            return step_summary(step, step_run_id, &StepResult::from(e), timer.elapsed_ms());
        }
        let guard = self.finalize_guard("step_run", step_run_id, FinalizeTarget::Step);

        self.emit(events::STEP_STARTED, tenant_id, pipeline_run_id, json!({
            "step_id": step.step_id,
            "step_type": step.step_type,
        }))
        .await;

        let credential = match &step.credential {
            Some(provider) => match self.deps.secrets.fetch(tenant_id, provider).await {
                Ok(credential) => Some(CredentialHandle::lease(credential)),
                Err(e) => {
                    let result = StepResult::failed(format!("credential '{provider}': {e}"));
                    return self
                        .finish_step(guard, step, step_run_id, pipeline_run_id, tenant_id, result, &timer)
                        .await;
                }
            },
            None => None,
        };

        let result = self
            .invoke_engine(step, definition, invocation, parameters, pipeline_run_id, step_run_id, credential.clone(), token)
            .await;

        if let Some(handle) = &credential {
            handle.clear();
        }
        self.finish_step(guard, step, step_run_id, pipeline_run_id, tenant_id, result, &timer)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_engine(
        &self,
        step: &StepDefinition,
        definition: &PipelineDefinition,
        invocation: &Invocation,
        parameters: &HashMap<String, Value>,
        pipeline_run_id: Uuid,
        step_run_id: Uuid,
        credential: Option<CredentialHandle>,
        token: &Arc<CancellationToken>,
    ) -> StepResult {
        let engine = match self.deps.registry.resolve(&step.step_type) {
            Ok(engine) => engine,
            Err(e) => return StepResult::from(e),
        };

        let mut ctx = StepContext::new(
            invocation.tenant_id.clone(),
            definition.pipeline_id.clone(),
            pipeline_run_id,
            step.step_id.clone(),
            self.deps.warehouse.clone(),
            self.deps.writer.clone(),
        )
        .with_step_run_id(step_run_id)
        .with_run_date(invocation.run_date)
        .with_parameters(parameters.clone())
        .with_variables(definition.variables.clone())
        .with_cancellation(token.clone());
        if let Some(handle) = credential {
            ctx = ctx.with_credential(handle);
        }

        let mut config = step.config.clone();
        if let Some(partition) = &step.partition {
            config
                .entry("partition_field")
                .or_insert_with(|| Value::from(partition.field.as_str()));
            if let Some(batch_size) = partition.batch_size {
                config.entry("batch_size").or_insert_with(|| Value::from(batch_size));
            }
        }

        let timeout = step.timeout(self.deps.timeouts.step_timeout());
        let grace = self.deps.timeouts.grace_period();
        let operation = format!("step '{}'", step.step_id);
        let run = run_with_timeout(&operation, timeout, async {
            Ok(engine.execute(&config, &ctx).await)
        });
        let bounded = async {
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => result,
                () = async {
                    token.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    warn!(grace_ms = %grace.as_millis(), "Step still running after cancellation; abandoning it");
                    Err(FlowgateError::timeout(format!("{operation} after cancellation"), grace))
                }
            }
        };
        match catch_panic(bounded).await {
            Ok(result) => result,
            Err(e) => StepResult::from(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_step(
        &self,
        guard: FinalizeGuard,
        step: &StepDefinition,
        step_run_id: Uuid,
        pipeline_run_id: Uuid,
        tenant_id: &str,
        result: StepResult,
        timer: &SpanTimer,
    ) -> StepSummary {
        let outcome = if result.is_success() {
            RunOutcome::completed(result.rows_processed)
        } else {
            RunOutcome {
                rows_processed: result.rows_processed,
                ..RunOutcome::failed(result.error.clone().unwrap_or_else(|| "step failed".to_string()))
            }
        };

        match with_retry(&self.deps.retry, "runs.finish_step_run", || {
            self.deps.run_log.finish_step_run(step_run_id, &outcome)
        })
        .await
        {
            Ok(_) => guard.disarm(),
            Err(e) => {
                error!(error = %e, "Could not record step end; writing fallback");
                guard.finalize().await;
            }
        }

        let summary = step_summary(step, step_run_id, &result, timer.elapsed_ms());
        if result.is_success() {
            info!(rows = result.rows_processed, duration_ms = summary.duration_ms, "Step completed");
        } else {
            warn!(error = ?result.error, duration_ms = summary.duration_ms, "Step failed");
        }

        let event = if result.is_success() {
            events::STEP_COMPLETED
        } else {
            events::STEP_FAILED
        };
        self.emit(event, tenant_id, pipeline_run_id, json!({
            "step_id": step.step_id,
            "rows_processed": result.rows_processed,
            "error": result.error,
            "details": result.details,
        }))
        .await;
        summary
    }

    fn finalize_guard(&self, label: &'static str, id: Uuid, target: FinalizeTarget) -> FinalizeGuard {
        let run_log = self.deps.run_log.clone();
        let active = self.active.clone();
        FinalizeGuard::new(label, move || {
            async move {
                active.remove(&id);
                let outcome = RunOutcome::failed("aborted before completion");
                let written = match target {
                    FinalizeTarget::Pipeline => run_log.finalize_pipeline_run(id, &outcome).await,
                    FinalizeTarget::Step => run_log.finish_step_run(id, &outcome).await,
                };
                if let Err(e) = written {
                    error!(id = %id, guard = label, error = %e, "Fallback finalization failed");
                }
            }
            .boxed()
        })
    }

    async fn finalize_pipeline(&self, guard: FinalizeGuard, pipeline_run_id: Uuid, outcome: &RunOutcome) {
        match with_retry(&self.deps.retry, "runs.finalize_pipeline_run", || {
            self.deps.run_log.finalize_pipeline_run(pipeline_run_id, outcome)
        })
        .await
        {
            Ok(true) => guard.disarm(),
            Ok(false) => {
                warn!("Pipeline run was already finalized");
                guard.disarm();
            }
            Err(e) => {
                error!(error = %e, "Could not finalize pipeline run; writing fallback");
                guard.finalize().await;
            }
        }
    }

    async fn announce(&self, summary: &ExecutionSummary) {
        let (event, severity, message) = if summary.is_success() {
            (
                events::RUN_COMPLETED,
                Severity::Info,
                format!(
                    "Pipeline '{}' completed: {} rows in {}ms",
                    summary.pipeline_id,
                    summary.rows_processed(),
                    summary.duration_ms
                ),
            )
        } else {
            (
                events::RUN_FAILED,
                Severity::Error,
                format!(
                    "Pipeline '{}' failed: {}",
                    summary.pipeline_id,
                    summary.error_message.as_deref().unwrap_or("unknown error")
                ),
            )
        };

        if summary.is_success() {
            info!(duration_ms = summary.duration_ms, "Pipeline run completed");
        } else {
            warn!(error = ?summary.error_message, "Pipeline run failed");
        }
        self.emit(event, &summary.tenant_id, summary.pipeline_run_id, json!({
            "pipeline_id": summary.pipeline_id,
            "status": summary.status,
            "steps": summary.steps.len(),
            "duration_ms": summary.duration_ms,
            "error": summary.error_message,
        }))
        .await;
        notify_best_effort(
            self.deps.notifier.as_ref(),
            &summary.tenant_id,
            event,
            severity,
            &message,
        )
        .await;
    }

    async fn emit(&self, event_type: &str, tenant_id: &str, pipeline_run_id: Uuid, data: Value) {
        self.deps
            .events
            .emit(AuditEvent::new(event_type, tenant_id, pipeline_run_id.to_string(), data))
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
enum FinalizeTarget {
    Pipeline,
    Step,
}

fn step_summary(step: &StepDefinition, step_run_id: Uuid, result: &StepResult, duration_ms: u64) -> StepSummary {
    StepSummary {
        step_id: step.step_id.clone(),
        step_run_id,
        status: if result.is_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        },
        rows_processed: result.rows_processed,
        error: result.error.clone(),
        optional: step.optional,
        duration_ms,
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("registry", &self.deps.registry)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}
