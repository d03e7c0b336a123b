//! Declarative pipeline definitions.

use crate::errors::{ConfigError, Result};
use crate::registry::{EngineRegistry, StepConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

static STEP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]{0,63}$").expect("valid regex"));

/// Rejects ids that are not `[A-Za-z0-9][A-Za-z0-9_-]*`.
pub fn validate_id(value: &str, field: &str) -> Result<()> {
    if STEP_ID_RE.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::new(format!("invalid {field} '{value}'"))
            .with_field(field)
            .into())
    }
}

/// How a step fans out over partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Column whose distinct values define the partitions.
    pub field: String,
    /// Partitions per batch; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique id within the pipeline.
    pub step_id: String,
    /// Registered engine type.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Engine configuration.
    #[serde(default)]
    pub config: StepConfig,
    /// Optional partition fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionSpec>,
    /// A failing optional step does not abort the pipeline.
    #[serde(default)]
    pub optional: bool,
    /// Overrides the default step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Secret provider whose credential the step needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl StepDefinition {
    /// Creates a required step with an empty config.
    #[must_use]
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            config: StepConfig::new(),
            partition: None,
            optional: false,
            timeout_secs: None,
            credential: None,
        }
    }

    /// Sets a config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Sets the partition fan-out.
    #[must_use]
    pub fn with_partition(mut self, field: impl Into<String>, batch_size: Option<usize>) -> Self {
        self.partition = Some(PartitionSpec {
            field: field.into(),
            batch_size,
        });
        self
    }

    /// Marks the step optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the step timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Requests a credential from `provider`.
    #[must_use]
    pub fn with_credential(mut self, provider: impl Into<String>) -> Self {
        self.credential = Some(provider.into());
        self
    }

    /// The step timeout, falling back to `default`.
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map_or(default, Duration::from_secs)
    }
}

/// An ordered list of steps plus the values they are templated with.
///
/// Immutable once loaded for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline id.
    pub pipeline_id: String,
    /// Steps in execution order.
    pub steps: Vec<StepDefinition>,
    /// Values available to `${var}` templates.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Default trigger parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl PipelineDefinition {
    /// Creates a definition with no variables or parameters.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            steps,
            variables: HashMap::new(),
            parameters: HashMap::new(),
        }
    }

    /// Checks structure and that every step type is registered.
    pub fn validate(&self, registry: &EngineRegistry) -> Result<()> {
        validate_id(&self.pipeline_id, "pipeline_id")?;
        if self.steps.is_empty() {
            return Err(ConfigError::new(format!("pipeline '{}' has no steps", self.pipeline_id))
                .with_field("steps")
                .into());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !STEP_ID_RE.is_match(&step.step_id) {
                return Err(ConfigError::new(format!("invalid step id '{}'", step.step_id))
                    .with_field("step_id")
                    .with_step(&step.step_id)
                    .into());
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(ConfigError::new(format!("duplicate step id '{}'", step.step_id))
                    .with_field("step_id")
                    .with_step(&step.step_id)
                    .into());
            }
            if !registry.contains(&step.step_type) {
                return Err(ConfigError::new(format!(
                    "step '{}' has unknown type '{}'",
                    step.step_id, step.step_type
                ))
                .with_field("type")
                .with_step(&step.step_id)
                .into());
            }
            if step.timeout_secs == Some(0) {
                return Err(ConfigError::new("timeout_secs must be positive")
                    .with_field("timeout_secs")
                    .with_step(&step.step_id)
                    .into());
            }
            if let Some(partition) = &step.partition {
                crate::warehouse::validate_identifier(&partition.field, "partition.field")?;
                if partition.batch_size == Some(0) {
                    return Err(ConfigError::new("partition.batch_size must be positive")
                        .with_field("partition.batch_size")
                        .with_step(&step.step_id)
                        .into());
                }
            }
        }
        Ok(())
    }

    /// Looks a step up by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}
