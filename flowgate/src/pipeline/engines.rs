//! Built-in step engines.

use crate::errors::{ConfigError, FlowgateError, Result};
use crate::partition::{PartitionJob, PartitionOptions, PartitionedQueryExecutor};
use crate::registry::{EngineRegistry, StepConfig, StepContext, StepEngine, StepResult};
use crate::warehouse::{SelectQuery, TableRef};
use crate::writer::stamp_query;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Type string of [`NoopEngine`].
pub const NOOP: &str = "noop";
/// Type string of [`PartitionedQueryEngine`].
pub const PARTITIONED_QUERY: &str = "partitioned_query";

const DEFAULT_CREDENTIAL_ID: &str = "default";

/// Succeeds without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEngine;

#[async_trait]
impl StepEngine for NoopEngine {
    async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
        StepResult::success(0)
    }
}

/// Copies a source table into a destination one partition at a time.
///
/// Config keys: `source` and `destination` (`dataset.table`),
/// `partition_field`, optional `columns`, `credential_id`, `batch_size`
/// and `resume_from_batch`. Copied rows carry the step's lineage columns.
#[derive(Debug, Clone)]
pub struct PartitionedQueryEngine {
    executor: PartitionedQueryExecutor,
    default_batch_size: usize,
    grace_period: Duration,
}

impl PartitionedQueryEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(executor: PartitionedQueryExecutor, default_batch_size: usize, grace_period: Duration) -> Self {
        Self {
            executor,
            default_batch_size,
            grace_period,
        }
    }

    async fn run(&self, config: &StepConfig, ctx: &StepContext) -> Result<StepResult> {
        let source = TableRef::parse(required_str(config, "source")?)?;
        let destination = TableRef::parse(required_str(config, "destination")?)?;
        let field = required_str(config, "partition_field")?;

        let mut base = SelectQuery::all(source.clone());
        if let Some(columns) = config.get("columns") {
            let columns: Vec<String> = serde_json::from_value(columns.clone())
                .map_err(|e| ConfigError::new(format!("columns: {e}")).with_field("columns"))?;
            base = base.with_columns(columns)?;
        }
        let credential_id = config
            .get("credential_id")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CREDENTIAL_ID);
        let key = ctx.lineage_key(credential_id);
        key.validate()?;
        let base = stamp_query(base, &key, &ctx.run_id(), Utc::now())?;
        let job = PartitionJob::new(source.clone(), field, destination)?.with_base_query(base)?;

        let batch_size = optional_usize(config, "batch_size")?.unwrap_or(self.default_batch_size);
        let resume_from = optional_usize(config, "resume_from_batch")?.unwrap_or(0);
        let options = PartitionOptions::new(batch_size, self.grace_period).resume_from(resume_from);

        let partitions = self.executor.detect_partitions(&source, field).await?;
        let report = self
            .executor
            .execute(&job, &partitions, options, ctx.cancellation())
            .await?;

        Ok(StepResult::success(report.rows_written)
            .with_detail("partitions", report.partitions_completed)
            .with_detail("batches", report.batches_completed)
            .with_detail("bytes_processed", report.bytes_processed))
    }
}

#[async_trait]
impl StepEngine for PartitionedQueryEngine {
    async fn execute(&self, config: &StepConfig, ctx: &StepContext) -> StepResult {
        match self.run(config, ctx).await {
            Ok(result) => result,
            Err(FlowgateError::Partition(failure)) => {
                let resume_from = failure.batch_index;
                let rows = failure.rows_written;
                StepResult::from(FlowgateError::Partition(failure))
                    .with_detail("resume_from_batch", resume_from)
                    .with_detail("committed_rows", rows)
            }
            Err(e) => StepResult::from(e),
        }
    }
}

fn required_str<'a>(config: &'a StepConfig, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::new(format!("missing string config '{key}'")).with_field(key).into())
}

fn optional_usize(config: &StepConfig, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::new(format!("config '{key}' must be a non-negative integer"))
                    .with_field(key)
                    .into()
            }),
    }
}

/// Registers the built-in engines.
pub fn register_builtin(registry: &EngineRegistry, partitioned: PartitionedQueryEngine) {
    registry.register(NOOP, Arc::new(NoopEngine));
    registry.register(PARTITIONED_QUERY, Arc::new(partitioned));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CREDENTIAL_ID_COLUMN, LINEAGE_COLUMNS, RUN_ID_COLUMN, TENANT_ID_COLUMN};
    use crate::registry::StepStatus;
    use crate::retry::RetryConfig;
    use crate::warehouse::{MemoryWarehouse, Row, Warehouse};
    use crate::writer::IdempotentWriter;
    use serde_json::json;
    use uuid::Uuid;

    fn setup() -> (Arc<MemoryWarehouse>, PartitionedQueryEngine, StepContext) {
        let wh = Arc::new(MemoryWarehouse::new());
        let rows: Vec<Row> = (0..6)
            .map(|i| json!({"day": format!("d{}", i % 3), "cost": i}).as_object().cloned().unwrap())
            .collect();
        wh.seed(&TableRef::new("raw", "usage").unwrap(), rows);

        let dyn_wh: Arc<dyn Warehouse> = wh.clone();
        let executor = PartitionedQueryExecutor::new(dyn_wh.clone(), RetryConfig::no_retry(), Duration::from_secs(5));
        let engine = PartitionedQueryEngine::new(executor, 2, Duration::from_secs(1));
        let writer = IdempotentWriter::new(dyn_wh.clone(), RetryConfig::no_retry(), 10);
        let ctx = StepContext::new("acme", "p", Uuid::now_v7(), "copy", dyn_wh, writer);
        (wh, engine, ctx)
    }

    fn config(value: Value) -> StepConfig {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_partitioned_engine_copies_everything() {
        let (wh, engine, ctx) = setup();
        let result = engine
            .execute(
                &config(json!({"source": "raw.usage", "destination": "mart.usage", "partition_field": "day"})),
                &ctx,
            )
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.rows_processed, 6);
        assert_eq!(result.details["partitions"], 3);
        assert_eq!(result.details["batches"], 2);
        assert_eq!(wh.rows(&TableRef::new("mart", "usage").unwrap()).len(), 6);
    }

    #[tokio::test]
    async fn test_partitioned_engine_projects_columns() {
        let (wh, engine, ctx) = setup();
        engine
            .execute(
                &config(json!({
                    "source": "raw.usage", "destination": "mart.costs",
                    "partition_field": "day", "columns": ["cost"], "batch_size": 3
                })),
                &ctx,
            )
            .await;

        let rows = wh.rows(&TableRef::new("mart", "costs").unwrap());
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.contains_key("cost") && !r.contains_key("day")));
    }

    #[tokio::test]
    async fn test_partitioned_engine_stamps_lineage() {
        let (wh, engine, ctx) = setup();
        let run_id = ctx.run_id();
        let result = engine
            .execute(
                &config(json!({
                    "source": "raw.usage", "destination": "mart.usage",
                    "partition_field": "day", "credential_id": "cred-9"
                })),
                &ctx,
            )
            .await;
        assert!(result.is_success(), "{result:?}");

        let rows = wh.rows(&TableRef::new("mart", "usage").unwrap());
        assert_eq!(rows.len(), 6);
        for row in &rows {
            for column in LINEAGE_COLUMNS {
                assert!(row.contains_key(column), "missing {column}");
            }
            assert_eq!(row[TENANT_ID_COLUMN], "acme");
            assert_eq!(row[CREDENTIAL_ID_COLUMN], "cred-9");
            assert_eq!(row[RUN_ID_COLUMN], json!(run_id));
        }
    }

    #[tokio::test]
    async fn test_partition_failure_reports_resume_point() {
        let (wh, engine, ctx) = setup();
        wh.fail_partition("d2");

        let result = engine
            .execute(
                &config(json!({"source": "raw.usage", "destination": "mart.usage", "partition_field": "day", "batch_size": 2})),
                &ctx,
            )
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.details["resume_from_batch"], 1);
        assert_eq!(result.details["committed_rows"], 4);
        assert_eq!(result.details["kind"], "partition");
    }

    #[tokio::test]
    async fn test_missing_config_fails_step() {
        let (_wh, engine, ctx) = setup();
        let result = engine
            .execute(&config(json!({"source": "raw.usage"})), &ctx)
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.details["kind"], "config");
        assert!(result.error.unwrap().contains("destination"));
    }

    #[test]
    fn test_register_builtin() {
        let (_wh, engine, _ctx) = setup();
        let registry = EngineRegistry::new();
        register_builtin(&registry, engine);
        assert_eq!(registry.step_types(), vec![NOOP, PARTITIONED_QUERY]);
    }
}
