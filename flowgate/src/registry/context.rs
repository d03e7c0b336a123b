//! Per-step execution context.

use crate::cancellation::CancellationToken;
use crate::collaborators::CredentialHandle;
use crate::core::LineageKey;
use crate::errors::{FlowgateError, Result};
use crate::warehouse::Warehouse;
use crate::writer::IdempotentWriter;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a step engine may use while it runs.
///
/// Built by the executor for one step execution and dropped afterwards.
#[derive(Clone)]
pub struct StepContext {
    /// Owning tenant.
    pub tenant_id: String,
    /// Pipeline being executed.
    pub pipeline_id: String,
    /// The pipeline run this step belongs to.
    pub pipeline_run_id: Uuid,
    /// This step execution.
    pub step_run_id: Uuid,
    /// The step's id in the definition.
    pub step_id: String,
    /// Logical date of the run, used for lineage.
    pub run_date: NaiveDate,
    /// Parameters supplied at trigger time.
    pub parameters: HashMap<String, Value>,
    /// Resolved pipeline variables.
    pub variables: HashMap<String, Value>,
    credential: Option<CredentialHandle>,
    warehouse: Arc<dyn Warehouse>,
    writer: IdempotentWriter,
    cancellation: Arc<CancellationToken>,
}

impl StepContext {
    /// Creates a context with no parameters, variables or credential.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        pipeline_run_id: Uuid,
        step_id: impl Into<String>,
        warehouse: Arc<dyn Warehouse>,
        writer: IdempotentWriter,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pipeline_id: pipeline_id.into(),
            pipeline_run_id,
            step_run_id: Uuid::now_v7(),
            step_id: step_id.into(),
            run_date: chrono::Utc::now().date_naive(),
            parameters: HashMap::new(),
            variables: HashMap::new(),
            credential: None,
            warehouse,
            writer,
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the step run id.
    #[must_use]
    pub fn with_step_run_id(mut self, step_run_id: Uuid) -> Self {
        self.step_run_id = step_run_id;
        self
    }

    /// Sets the run date.
    #[must_use]
    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    /// Sets trigger parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets pipeline variables.
    #[must_use]
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Attaches a leased credential.
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialHandle) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Shares the run's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Looks `key` up in the parameters, then in the variables.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).or_else(|| self.variables.get(key))
    }

    /// The leased credential, if the step declared one.
    #[must_use]
    pub fn credential(&self) -> Option<&CredentialHandle> {
        self.credential.as_ref()
    }

    /// The credential's secret; fails if none was leased or it expired.
    pub fn secret(&self) -> Result<String> {
        self.credential
            .as_ref()
            .ok_or_else(|| {
                FlowgateError::config(format!("step '{}' declared no credential", self.step_id))
            })?
            .secret()
    }

    /// The lineage key for rows this step writes under `credential_id`.
    #[must_use]
    pub fn lineage_key(&self, credential_id: impl Into<String>) -> LineageKey {
        LineageKey::new(
            self.tenant_id.clone(),
            self.pipeline_id.clone(),
            credential_id,
            self.run_date,
        )
    }

    /// The run id stamped on written rows.
    #[must_use]
    pub fn run_id(&self) -> String {
        self.pipeline_run_id.to_string()
    }

    /// The warehouse.
    #[must_use]
    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// The idempotent writer.
    #[must_use]
    pub fn writer(&self) -> &IdempotentWriter {
        &self.writer
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("tenant_id", &self.tenant_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("pipeline_run_id", &self.pipeline_run_id)
            .field("step_run_id", &self.step_run_id)
            .field("step_id", &self.step_id)
            .field("run_date", &self.run_date)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}
