//! Bounded pool draining due scheduled runs.
//!
//! Each sweep fetches the runs due for a date, claims the `SCHEDULED`
//! ones with a CAS, and hands them to [`PipelineExecutor::run_scheduled`]
//! with at most `max_concurrent_runs` in flight. Several pools may sweep
//! the same store; the state machine decides who wins a run.

use crate::cancellation::CancellationToken;
use crate::core::RunState;
use crate::errors::{FlowgateError, Result};
use crate::pipeline::PipelineExecutor;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Runs handed to the executor.
    pub dispatched: usize,
    /// Runs that completed.
    pub completed: usize,
    /// Runs that failed (terminally or queued for retry).
    pub failed: usize,
    /// Runs left `PENDING` by admission control.
    pub deferred: usize,
    /// Runs another worker claimed first.
    pub skipped: usize,
    /// Runs that ended with an unexpected error.
    pub errors: usize,
}

/// Executes due scheduled runs with bounded concurrency.
#[derive(Clone)]
pub struct RunWorkerPool {
    executor: PipelineExecutor,
    permits: Arc<Semaphore>,
    max_concurrent_runs: usize,
    poll_interval: Duration,
    stale_after: Duration,
}

impl RunWorkerPool {
    /// Creates a pool running at most `max_concurrent_runs` at once.
    #[must_use]
    pub fn new(
        executor: PipelineExecutor,
        max_concurrent_runs: usize,
        poll_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        let max_concurrent_runs = max_concurrent_runs.max(1);
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent_runs)),
            max_concurrent_runs,
            poll_interval,
            stale_after,
        }
    }

    /// The executor runs are handed to.
    #[must_use]
    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Runs that could start right now.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs every run due on `date` and waits for all of them.
    #[instrument(skip(self), fields(max_concurrent = self.max_concurrent_runs))]
    pub async fn drain_due(&self, date: NaiveDate) -> Result<DrainReport> {
        let due = self.executor.state().get_due_runs(date).await?;
        let mut report = DrainReport::default();
        if due.is_empty() {
            debug!("no due runs");
            return Ok(report);
        }

        let mut handles = Vec::with_capacity(due.len());
        for run in due {
            if run.state == RunState::Scheduled && !self.executor.state().mark_as_pending(&run.run_id).await? {
                debug!(run_id = %run.run_id, "run claimed elsewhere");
                report.skipped += 1;
                continue;
            }

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| FlowgateError::Internal("worker pool closed".to_string()))?;
            let executor = self.executor.clone();
            let run_id = run.run_id.clone();
            handles.push((
                run.run_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    executor.run_scheduled(&run_id).await
                }),
            ));
            report.dispatched += 1;
        }

        for (run_id, handle) in handles {
            match handle.await {
                Ok(Ok(summary)) if summary.is_success() => report.completed += 1,
                Ok(Ok(_)) => report.failed += 1,
                Ok(Err(FlowgateError::AdmissionDenied { limit, .. })) => {
                    info!(run_id = %run_id, %limit, "run deferred by quota");
                    report.deferred += 1;
                }
                Ok(Err(FlowgateError::StateConflict(conflict))) => {
                    debug!(run_id = %run_id, actual = ?conflict.actual, "run taken by another worker");
                    report.skipped += 1;
                }
                Ok(Err(e)) => {
                    warn!(run_id = %run_id, error = %e, "scheduled run errored");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "scheduled run task aborted");
                    report.errors += 1;
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweeps every `poll_interval` until `shutdown` is cancelled.
    ///
    /// Cancellation is forwarded to in-flight runs, and the current sweep
    /// is awaited before returning.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!(poll_interval_ms = %self.poll_interval.as_millis(), "worker pool started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweep = self.sweep();
            tokio::pin!(sweep);
            tokio::select! {
                () = &mut sweep => {}
                () = shutdown.cancelled() => {
                    let reason = shutdown.reason().unwrap_or_else(|| "shutdown".to_string());
                    self.executor.shutdown(&reason);
                    sweep.await;
                    break;
                }
            }
        }
        info!("worker pool stopped");
    }

    async fn sweep(&self) {
        match self.executor.state().recover_stale_runs(self.stale_after).await {
            Ok(recovered) if !recovered.is_empty() => {
                warn!(count = recovered.len(), "recovered stale runs");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stale run recovery failed"),
        }
        if let Err(e) = self.drain_due(Utc::now().date_naive()).await {
            error!(error = %e, "sweep failed");
        }
    }
}

impl std::fmt::Debug for RunWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWorkerPool")
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("available", &self.available_slots())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineDefinition, StepDefinition};
    use crate::quota::QuotaLimits;
    use crate::testing::{OverlapTrackingEngine, FailingEngine, TestHarness};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::Ordering;

    fn slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn slot_date() -> NaiveDate {
        slot().date_naive()
    }

    async fn schedule(harness: &TestHarness, tenant: &str, pipeline: &str, seconds_before: i64) -> String {
        harness
            .app
            .state
            .create_scheduled_run(tenant, pipeline, slot() - ChronoDuration::seconds(seconds_before))
            .await
            .unwrap()
    }

    fn pool(harness: &TestHarness, max: usize) -> RunWorkerPool {
        RunWorkerPool::new(
            harness.app.executor.clone(),
            max,
            Duration::from_millis(20),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_respects_pool_bound() {
        let harness = TestHarness::new();
        harness.set_limits("acme", QuotaLimits { daily: 100, monthly: 100, concurrent: 100 });
        let tracker = Arc::new(OverlapTrackingEngine::new(Duration::from_millis(40)));
        harness.app.registry.register("tracked", tracker.clone());
        harness.define(&PipelineDefinition::new("slow", vec![StepDefinition::new("s", "tracked")]));

        for i in 0..6 {
            schedule(&harness, "acme", "slow", i + 1).await;
        }
        let report = pool(&harness, 2).drain_due(slot_date()).await.unwrap();

        assert_eq!(report.dispatched, 6);
        assert_eq!(report.completed, 6);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
        let completed = harness.app.state.runs_in_state("acme", RunState::Completed).await.unwrap();
        assert_eq!(completed.len(), 6);
    }

    #[tokio::test]
    async fn test_denied_run_stays_pending() {
        let harness = TestHarness::new();
        harness.set_limits("acme", QuotaLimits { daily: 1, monthly: 100, concurrent: 5 });
        harness.define(&PipelineDefinition::new("p", vec![StepDefinition::new("a", "noop")]));
        schedule(&harness, "acme", "p", 5).await;
        schedule(&harness, "acme", "p", 10).await;

        let report = pool(&harness, 1).drain_due(slot_date()).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.deferred, 1);
        let pending = harness.app.state.runs_in_state("acme", RunState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_failed_run_requeued_with_retry_count() {
        let harness = TestHarness::new();
        harness.app.registry.register("fail", Arc::new(FailingEngine::new("upstream down")));
        harness.define(&PipelineDefinition::new("p", vec![StepDefinition::new("a", "fail")]));
        let run_id = schedule(&harness, "acme", "p", 1).await;

        let report = pool(&harness, 2).drain_due(slot_date()).await.unwrap();

        assert_eq!(report.failed, 1);
        let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.retry_count, 1);
        assert!(run.error_message.unwrap().contains("upstream down"));
    }

    #[tokio::test]
    async fn test_future_runs_not_drained() {
        let harness = TestHarness::new();
        harness.define(&PipelineDefinition::new("p", vec![StepDefinition::new("a", "noop")]));
        let run_id = harness
            .app
            .state
            .create_scheduled_run("acme", "p", Utc::now() + ChronoDuration::minutes(30))
            .await
            .unwrap();

        let report = pool(&harness, 2).drain_due(Utc::now().date_naive()).await.unwrap();

        assert_eq!(report, DrainReport::default());
        let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Scheduled);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let harness = TestHarness::new();
        harness.define(&PipelineDefinition::new("p", vec![StepDefinition::new("a", "noop")]));
        let run_id = harness
            .app
            .state
            .create_scheduled_run("acme", "p", Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        let pool = pool(&harness, 2);
        let shutdown = Arc::new(CancellationToken::new());
        let handle = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel("test over");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pool stops")
            .unwrap();

        let run = harness.app.state.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Completed);
    }
}
