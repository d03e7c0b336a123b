//! In-memory [`StateStore`].

use super::store::{CasResult, StateStore, TransitionPatch};
use crate::core::{RunState, ScheduledRun};
use crate::errors::{FlowgateError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A [`StateStore`] over a concurrent map.
///
/// Each conditional write holds the row's shard lock for the duration of
/// the compare and the update, which gives the same single-winner
/// guarantee as a conditional `UPDATE`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    runs: DashMap<String, ScheduledRun>,
    writes: AtomicUsize,
    transient_failures: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` calls with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Number of write attempts (inserts, conditional writes, touches).
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no runs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn maybe_fail(&self) -> Result<()> {
        let consumed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(FlowgateError::transient("state store unavailable"))
        } else {
            Ok(())
        }
    }

    fn collect<F>(&self, predicate: F) -> Vec<ScheduledRun>
    where
        F: Fn(&ScheduledRun) -> bool,
    {
        let mut runs: Vec<ScheduledRun> = self
            .runs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        runs
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_if_absent(&self, run: &ScheduledRun) -> Result<bool> {
        self.maybe_fail()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        match self.runs.entry(run.run_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, run_id: &str) -> Result<Option<ScheduledRun>> {
        self.maybe_fail()?;
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn compare_and_set(
        &self,
        run_id: &str,
        expected: RunState,
        target: RunState,
        patch: &TransitionPatch,
    ) -> Result<CasResult> {
        self.maybe_fail()?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let Some(mut run) = self.runs.get_mut(run_id) else {
            return Ok(CasResult::NotFound);
        };
        if run.state != expected {
            return Ok(CasResult::StateMismatch { actual: run.state });
        }
        patch.apply(&mut run, target, Utc::now());
        Ok(CasResult::Applied)
    }

    async fn touch(&self, run_id: &str, expected: RunState) -> Result<bool> {
        self.maybe_fail()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(match self.runs.get_mut(run_id) {
            Some(mut run) if run.state == expected => {
                run.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn due_runs(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<Vec<ScheduledRun>> {
        self.maybe_fail()?;
        Ok(self.collect(|r| r.scheduled_date() == date && r.is_due(now)))
    }

    async fn runs_in_state(&self, tenant_id: Option<&str>, state: RunState) -> Result<Vec<ScheduledRun>> {
        self.maybe_fail()?;
        Ok(self.collect(|r| r.state == state && tenant_id.map_or(true, |t| r.tenant_id == t)))
    }

    async fn stale_runs(&self, state: RunState, before: DateTime<Utc>) -> Result<Vec<ScheduledRun>> {
        self.maybe_fail()?;
        Ok(self.collect(|r| r.state == state && r.updated_at < before))
    }
}
