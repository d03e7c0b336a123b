//! Pipeline definitions and their execution.
//!
//! This module provides:
//! - Declarative definitions and their validation
//! - A loader resolving `${var}` templates and resource paths
//! - The orchestrator running steps with guaranteed run records
//! - Built-in step engines

mod definition;
mod engines;
mod executor;
mod loader;
mod summary;

#[cfg(test)]
mod integration_tests;

pub use definition::{validate_id, PartitionSpec, PipelineDefinition, StepDefinition};
pub use engines::{register_builtin, NoopEngine, PartitionedQueryEngine, NOOP, PARTITIONED_QUERY};
pub use executor::{ExecutorDeps, PipelineExecutor, TriggerRequest};
pub use loader::{
    resolve_resource_paths, substitute_templates, DefinitionSource, DirectorySource, MemorySource,
    PipelineLoader, RawDefinition,
};
pub use summary::{ExecutionSummary, StepSummary};
