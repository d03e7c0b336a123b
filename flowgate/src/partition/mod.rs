//! Partitioned query execution with bounded parallelism.
//!
//! Partitions are grouped into fixed-size batches. Batches run one after
//! another; the partitions of one batch run concurrently as spawned
//! tasks, so a batch never has more than `batch_size` queries in flight.
//! The destination is prepared once before the first batch and every
//! partition appends to it.

mod plan;

pub use plan::{plan_batches, PartitionJob, PartitionOptions};

use crate::cancellation::{run_with_timeout, CancellationToken};
use crate::errors::{ConfigError, FlowgateError, PartitionError, Result};
use crate::retry::{with_retry, RetryConfig};
use crate::warehouse::{validate_identifier, QueryParam, QueryStats, TableRef, Warehouse};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Totals of a partitioned execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    /// Rows appended to the destination.
    pub rows_written: u64,
    /// Bytes scanned by all partitions.
    pub bytes_processed: u64,
    /// Batches completed by this execution.
    pub batches_completed: usize,
    /// Partitions completed by this execution.
    pub partitions_completed: usize,
}

type PartitionTask = JoinHandle<(QueryParam, Result<QueryStats>)>;

/// Runs a [`PartitionJob`] batch by batch.
#[derive(Clone)]
pub struct PartitionedQueryExecutor {
    warehouse: Arc<dyn Warehouse>,
    retry: RetryConfig,
    operation_timeout: Duration,
}

impl PartitionedQueryExecutor {
    /// Creates an executor; every warehouse call is bounded by `operation_timeout`.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, retry: RetryConfig, operation_timeout: Duration) -> Self {
        Self {
            warehouse,
            retry,
            operation_timeout,
        }
    }

    /// Distinct values of `partition_field` in `source`, ascending.
    #[instrument(skip(self), fields(source = %source))]
    pub async fn detect_partitions(&self, source: &TableRef, partition_field: &str) -> Result<Vec<QueryParam>> {
        validate_identifier(partition_field, "partition_field")?;
        let partitions = run_with_timeout(
            "detect_partitions",
            self.operation_timeout,
            with_retry(&self.retry, "partition.detect", || {
                self.warehouse.distinct_values(source, partition_field)
            }),
        )
        .await?;
        debug!(count = partitions.len(), "Detected partitions");
        Ok(partitions)
    }

    /// Runs `job` over `partitions`.
    ///
    /// A failing partition fails its batch with a [`PartitionError`]
    /// naming the batch to resume from. Cancellation waits up to the
    /// grace period for in-flight tasks, then abandons them with a
    /// timeout error.
    #[instrument(
        skip(self, job, partitions, cancel),
        fields(source = %job.source, destination = %job.destination, partitions = partitions.len(), batch_size = options.batch_size)
    )]
    pub async fn execute(
        &self,
        job: &PartitionJob,
        partitions: &[QueryParam],
        options: PartitionOptions,
        cancel: &CancellationToken,
    ) -> Result<PartitionReport> {
        let batches = plan_batches(partitions, options.batch_size)?;
        if options.resume_from_batch > batches.len() {
            return Err(ConfigError::new(format!(
                "cannot resume from batch {} of {}",
                options.resume_from_batch,
                batches.len()
            ))
            .with_field("resume_from_batch")
            .into());
        }

        self.prepare_destination(&job.destination, options.resume_from_batch > 0)
            .await?;

        let mut report = PartitionReport::default();
        for (index, batch) in batches.iter().enumerate().skip(options.resume_from_batch) {
            cancel.check()?;
            debug!(batch = index, size = batch.len(), "Starting batch");

            let stats = self
                .run_batch(job, index, batch, options.grace_period, cancel)
                .await
                .map_err(|failure| match failure {
                    BatchFailure::Partition { partition, error } => {
                        warn!(batch = index, partition = %partition, error = %error, "Partition failed; batch aborted");
                        FlowgateError::from(PartitionError {
                            batch_index: index,
                            partition: partition.to_string(),
                            committed_batches: index,
                            rows_written: report.rows_written,
                            bytes_processed: report.bytes_processed,
                            message: error.to_string(),
                        })
                    }
                    BatchFailure::Abandoned(error) => error,
                })?;

            report.rows_written += stats.rows_written;
            report.bytes_processed += stats.bytes_processed;
            report.batches_completed += 1;
            report.partitions_completed += batch.len();
        }

        info!(
            rows_written = report.rows_written,
            bytes_processed = report.bytes_processed,
            batches = report.batches_completed,
            "Partitioned execution complete"
        );
        Ok(report)
    }

    /// Creates the destination, or empties it unless resuming.
    async fn prepare_destination(&self, destination: &TableRef, resuming: bool) -> Result<()> {
        let exists = self.bounded("table_exists", || self.warehouse.table_exists(destination)).await?;
        if !exists {
            self.bounded("create_table", || self.warehouse.create_table(destination)).await
        } else if resuming {
            debug!(destination = %destination, "Resuming; keeping committed rows");
            Ok(())
        } else {
            self.bounded("truncate_table", || self.warehouse.truncate_table(destination)).await
        }
    }

    async fn bounded<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        run_with_timeout(operation, self.operation_timeout, with_retry(&self.retry, operation, call)).await
    }

    async fn run_batch(
        &self,
        job: &PartitionJob,
        index: usize,
        batch: &[QueryParam],
        grace_period: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<QueryStats, BatchFailure> {
        let queries = batch
            .iter()
            .map(|value| job.partition_query(value).map(|q| (value.clone(), q)))
            .collect::<Result<Vec<_>>>()
            .map_err(BatchFailure::Abandoned)?;

        let mut tasks: FuturesUnordered<PartitionTask> = FuturesUnordered::new();
        let mut aborts: Vec<AbortHandle> = Vec::with_capacity(queries.len());
        for (value, query) in queries {
            let warehouse = self.warehouse.clone();
            let retry = self.retry.clone();
            let destination = job.destination.clone();
            let timeout = self.operation_timeout;
            let handle = tokio::spawn(async move {
                let result = run_with_timeout(
                    "partition_query",
                    timeout,
                    with_retry(&retry, "partition.query", || warehouse.query_into(&query, &destination)),
                )
                .await;
                (value, result)
            });
            aborts.push(handle.abort_handle());
            tasks.push(handle);
        }

        let mut stats = QueryStats::default();
        let mut failure: Option<BatchFailure> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let next = match deadline {
                None => tokio::select! {
                    next = tasks.next() => next,
                    () = cancel.cancelled() => {
                        warn!(batch = index, grace_ms = %grace_period.as_millis(), "Cancelled; waiting for in-flight partitions");
                        deadline = Some(Instant::now() + grace_period);
                        continue;
                    }
                },
                Some(at) => match tokio::time::timeout_at(at, tasks.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        for abort in &aborts {
                            abort.abort();
                        }
                        return Err(BatchFailure::Abandoned(FlowgateError::timeout(
                            format!("batch {index} after cancellation"),
                            grace_period,
                        )));
                    }
                },
            };

            let Some(joined) = next else { break };
            match joined {
                Ok((_, Ok(partition_stats))) => stats += partition_stats,
                Ok((partition, Err(error))) => {
                    failure.get_or_insert(BatchFailure::Partition { partition, error });
                }
                Err(join_error) => {
                    failure.get_or_insert(BatchFailure::Abandoned(FlowgateError::Internal(format!(
                        "partition task failed: {join_error}"
                    ))));
                }
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None if deadline.is_some() => Err(BatchFailure::Abandoned(FlowgateError::Cancelled(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))),
            None => Ok(stats),
        }
    }
}

enum BatchFailure {
    Partition { partition: QueryParam, error: FlowgateError },
    Abandoned(FlowgateError),
}

impl std::fmt::Debug for PartitionedQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedQueryExecutor")
            .field("retry", &self.retry)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::warehouse::{MemoryWarehouse, Row, WarehouseOp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn source() -> TableRef {
        TableRef::new("raw", "usage").unwrap()
    }

    fn destination() -> TableRef {
        TableRef::new("mart", "usage_by_day").unwrap()
    }

    fn seeded(days: usize, rows_per_day: usize) -> Arc<MemoryWarehouse> {
        let wh = MemoryWarehouse::new().with_query_latency(Duration::from_millis(5));
        let rows: Vec<Row> = (0..days)
            .flat_map(|d| {
                (0..rows_per_day + d % 3).map(move |i| {
                    json!({"day": format!("2024-01-{:02}", d + 1), "n": i})
                        .as_object()
                        .cloned()
                        .unwrap()
                })
            })
            .collect();
        wh.seed(&source(), rows);
        Arc::new(wh)
    }

    fn executor(wh: &Arc<MemoryWarehouse>) -> PartitionedQueryExecutor {
        PartitionedQueryExecutor::new(wh.clone(), RetryConfig::no_retry(), Duration::from_secs(5))
    }

    fn job() -> PartitionJob {
        PartitionJob::new(source(), "day", destination()).unwrap()
    }

    #[tokio::test]
    async fn test_detect_partitions_sorted() {
        let wh = seeded(5, 2);
        let partitions = executor(&wh).detect_partitions(&source(), "day").await.unwrap();
        assert_eq!(partitions.len(), 5);
        assert_eq!(partitions[0], QueryParam::from("2024-01-01"));
        let days: Vec<String> = partitions.iter().map(ToString::to_string).collect();
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_rows_independent_of_batch_size() {
        let wh = seeded(12, 4);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();

        let unpartitioned = wh.rows(&source()).len() as u64;
        for batch_size in 1..=partitions.len() {
            let report = exec
                .execute(
                    &job(),
                    &partitions,
                    PartitionOptions::new(batch_size, Duration::from_secs(1)),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            assert_eq!(report.rows_written, unpartitioned, "batch_size {batch_size}");
            assert_eq!(wh.rows(&destination()).len() as u64, unpartitioned);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_37_partitions_in_batches_of_10() {
        let wh = seeded(37, 1);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();
        assert_eq!(partitions.len(), 37);

        let report = exec
            .execute(
                &job(),
                &partitions,
                PartitionOptions::new(10, Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.batches_completed, 4);
        assert_eq!(report.partitions_completed, 37);
        assert_eq!(wh.call_count(WarehouseOp::QueryInto), 37);
        assert!(wh.peak_concurrency() <= 10);
        assert!(wh.peak_concurrency() > 1);
    }

    #[tokio::test]
    async fn test_every_partition_query_is_parameterized() {
        let wh = seeded(3, 1);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();
        exec.execute(&job(), &partitions, PartitionOptions::new(2, Duration::ZERO), &CancellationToken::new())
            .await
            .unwrap();

        for statement in wh.statements() {
            assert!(!statement.sql.contains("2024-01"));
            assert_eq!(statement.params.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_partition_aborts_only_its_batch() {
        let wh = seeded(9, 2);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();
        wh.fail_partition("2024-01-05");

        let err = exec
            .execute(&job(), &partitions, PartitionOptions::new(3, Duration::ZERO), &CancellationToken::new())
            .await
            .unwrap_err();

        let FlowgateError::Partition(failure) = err else {
            panic!("expected a partition error, got {err:?}");
        };
        assert_eq!(failure.batch_index, 1);
        assert_eq!(failure.committed_batches, 1);
        assert_eq!(failure.partition, "2024-01-05");

        let committed: u64 = wh
            .rows(&source())
            .iter()
            .filter(|r| ["2024-01-01", "2024-01-02", "2024-01-03"].contains(&r["day"].as_str().unwrap()))
            .count() as u64;
        assert_eq!(failure.rows_written, committed);
        // batch 2 never started
        assert_eq!(wh.call_count(WarehouseOp::QueryInto), 6);
    }

    #[tokio::test]
    async fn test_resume_keeps_committed_batches() {
        let wh = seeded(9, 2);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();
        wh.fail_partition("2024-01-05");
        let failure = exec
            .execute(&job(), &partitions, PartitionOptions::new(3, Duration::ZERO), &CancellationToken::new())
            .await
            .unwrap_err();
        let FlowgateError::Partition(failure) = failure else {
            panic!("expected a partition error");
        };

        // drop the partial batch, as a dedup/merge destination would
        let committed_days = &partitions[..3];
        let kept: Vec<Row> = wh
            .rows(&destination())
            .into_iter()
            .filter(|r| committed_days.iter().any(|d| r["day"] == d.to_json()))
            .collect();
        wh.seed(&destination(), kept);

        let healthy = Arc::new(MemoryWarehouse::new());
        healthy.seed(&source(), wh.rows(&source()));
        healthy.seed(&destination(), wh.rows(&destination()));
        let report = executor(&healthy)
            .execute(
                &job(),
                &partitions,
                PartitionOptions::new(3, Duration::ZERO).resume_from(failure.batch_index),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.batches_completed, 2);
        assert_eq!(healthy.call_count(WarehouseOp::Truncate), 0);
        assert_eq!(healthy.rows(&destination()).len(), healthy.rows(&source()).len());
    }

    #[tokio::test]
    async fn test_rerun_truncates_destination() {
        let wh = seeded(4, 3);
        let exec = executor(&wh);
        let partitions = exec.detect_partitions(&source(), "day").await.unwrap();
        let options = PartitionOptions::new(2, Duration::ZERO);

        exec.execute(&job(), &partitions, options, &CancellationToken::new()).await.unwrap();
        exec.execute(&job(), &partitions, options, &CancellationToken::new()).await.unwrap();

        assert_eq!(wh.rows(&destination()).len(), wh.rows(&source()).len());
        assert_eq!(wh.call_count(WarehouseOp::Truncate), 1);
        assert_eq!(wh.call_count(WarehouseOp::CreateTable), 1);
    }

    #[tokio::test]
    async fn test_cancellation_after_grace_period_is_timeout() {
        let wh = Arc::new(MemoryWarehouse::new().with_query_latency(Duration::from_secs(30)));
        wh.seed(&source(), vec![json!({"day": "d1"}).as_object().cloned().unwrap()]);
        let exec = executor(&wh);
        let cancel = Arc::new(CancellationToken::new());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel("shutdown");
        });

        let err = exec
            .execute(
                &job(),
                &[QueryParam::from("d1")],
                PartitionOptions::new(1, Duration::from_millis(20)),
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_within_grace_period_is_cancelled() {
        let wh = seeded(2, 1);
        let exec = executor(&wh);
        let cancel = Arc::new(CancellationToken::new());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            trigger.cancel("shutdown");
        });

        let err = exec
            .execute(
                &job(),
                &[QueryParam::from("2024-01-01"), QueryParam::from("2024-01-02")],
                PartitionOptions::new(1, Duration::from_secs(5)),
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let wh = seeded(2, 1);
        let cancel = CancellationToken::new();
        cancel.cancel("stop");

        let err = executor(&wh)
            .execute(&job(), &[QueryParam::from("2024-01-01")], PartitionOptions::new(1, Duration::ZERO), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(wh.call_count(WarehouseOp::QueryInto), 0);
    }

    #[tokio::test]
    async fn test_integer_partitions_bind_as_integers() {
        let wh = Arc::new(MemoryWarehouse::new());
        let rows: Vec<Row> = (0..6)
            .map(|i| json!({"account": i % 3, "n": i}).as_object().cloned().unwrap())
            .collect();
        wh.seed(&source(), rows);
        let exec = executor(&wh);
        let job = PartitionJob::new(source(), "account", destination()).unwrap();

        let partitions = exec.detect_partitions(&source(), "account").await.unwrap();
        assert_eq!(partitions, vec![QueryParam::Int(0), QueryParam::Int(1), QueryParam::Int(2)]);

        let report = exec
            .execute(&job, &partitions, PartitionOptions::new(2, Duration::ZERO), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.rows_written, 6);
        assert_eq!(wh.rows(&destination()).len(), 6);
        assert!(wh
            .statements()
            .iter()
            .all(|s| matches!(s.params.as_slice(), [QueryParam::Int(_)])));
    }

    #[tokio::test]
    async fn test_resume_past_end_rejected() {
        let wh = seeded(2, 1);
        let err = executor(&wh)
            .execute(
                &job(),
                &[QueryParam::from("2024-01-01")],
                PartitionOptions::new(1, Duration::ZERO).resume_from(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
