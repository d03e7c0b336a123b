//! Idempotent writes to the warehouse.
//!
//! Two modes are offered:
//!
//! - **Dedup** deletes the previous generation of a [`LineageKey`] and
//!   inserts the new rows. Between the two statements readers may see no
//!   rows for the key.
//! - **Merge** upserts the rows in batches, each batch a single atomic
//!   statement keyed on the caller's keys plus the generation columns.
//!   Once every batch is committed, rows of the key written by other runs
//!   are deleted. No empty window is visible; a failed batch leaves
//!   earlier batches committed and is retried on its own.
//!
//! Both stamp the lineage columns on every row, so re-running a write
//! with the same inputs reproduces the same end state.

mod lineage;

pub use lineage::{generation_filters, stamp_query, tag_rows};

use crate::core::{LineageKey, RUN_ID_COLUMN};
use crate::errors::Result;
use crate::retry::{with_retry, RetryConfig};
use crate::warehouse::{DeleteStatement, EqFilter, MergeStatement, Row, TableRef, Warehouse};
use chrono::Utc;
use lineage::scoped_merge_keys;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How a step writes its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Batched atomic upsert.
    #[default]
    Merge,
    /// Delete the generation, then insert.
    Dedup,
}

/// Row counts of a dedup write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupOutcome {
    /// Rows of the previous generation removed.
    pub rows_deleted: u64,
    /// Rows inserted.
    pub rows_inserted: u64,
}

/// Writes rows so that retries never duplicate output.
#[derive(Clone)]
pub struct IdempotentWriter {
    warehouse: Arc<dyn Warehouse>,
    retry: RetryConfig,
    merge_batch_size: usize,
}

impl IdempotentWriter {
    /// Creates a writer; `merge_batch_size` is clamped to at least one.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, retry: RetryConfig, merge_batch_size: usize) -> Self {
        Self {
            warehouse,
            retry,
            merge_batch_size: merge_batch_size.max(1),
        }
    }

    /// The merge batch size.
    #[must_use]
    pub fn merge_batch_size(&self) -> usize {
        self.merge_batch_size
    }

    /// Replaces the generation identified by `key` with `rows`.
    ///
    /// The delete and the insert are retried together, so a transient
    /// failure after a partial insert is repaired by the next attempt's
    /// delete.
    #[instrument(
        skip(self, rows),
        fields(target = %target, tenant_id = %key.tenant_id, pipeline_id = %key.pipeline_id, run_id = %run_id, rows = rows.len())
    )]
    pub async fn write_with_dedup(
        &self,
        target: &TableRef,
        key: &LineageKey,
        rows: Vec<Row>,
        run_id: &str,
    ) -> Result<DedupOutcome> {
        key.validate()?;
        let delete = DeleteStatement::new(target.clone(), generation_filters(key)?)?;
        let tagged = tag_rows(rows, key, run_id, Utc::now());

        self.warehouse.ensure_table(target).await?;
        let outcome = with_retry(&self.retry, "writer.dedup", || {
            self.replace_generation(&delete, &tagged)
        })
        .await?;

        info!(
            rows_deleted = outcome.rows_deleted,
            rows_inserted = outcome.rows_inserted,
            "Dedup write complete"
        );
        Ok(outcome)
    }

    async fn replace_generation(&self, delete: &DeleteStatement, rows: &[Row]) -> Result<DedupOutcome> {
        let rows_deleted = self.warehouse.delete_rows(delete).await?;
        let rows_inserted = if rows.is_empty() {
            0
        } else {
            self.warehouse.insert_rows(&delete.target, rows).await?
        };
        Ok(DedupOutcome {
            rows_deleted,
            rows_inserted,
        })
    }

    /// Upserts `rows` keyed by `merge_keys` within the generation of `key`,
    /// one atomic statement per batch.
    ///
    /// Every batch is validated before the first one is submitted. Once all
    /// batches are committed, rows of the generation carrying another
    /// `run_id` are deleted. On failure, batches before the failing one
    /// stay committed and the previous generation is left in place.
    #[instrument(
        skip(self, merge_keys, rows),
        fields(target = %target, tenant_id = %key.tenant_id, pipeline_id = %key.pipeline_id, run_id = %run_id, rows = rows.len())
    )]
    pub async fn write_with_merge(
        &self,
        target: &TableRef,
        key: &LineageKey,
        merge_keys: &[String],
        rows: Vec<Row>,
        run_id: &str,
    ) -> Result<u64> {
        key.validate()?;
        let merge_keys = scoped_merge_keys(merge_keys);
        let stale = DeleteStatement::new(target.clone(), generation_filters(key)?)?
            .excluding(EqFilter::new(RUN_ID_COLUMN, run_id)?);
        let tagged = tag_rows(rows, key, run_id, Utc::now());
        let statements = tagged
            .chunks(self.merge_batch_size)
            .map(|batch| MergeStatement::new(target.clone(), merge_keys.clone(), batch.to_vec()))
            .collect::<Result<Vec<_>>>()?;

        if statements.is_empty() {
            if self.warehouse.table_exists(target).await? {
                let removed = with_retry(&self.retry, "writer.merge_cleanup", || {
                    self.warehouse.delete_rows(&stale)
                })
                .await?;
                info!(rows_removed = removed, "Empty merge cleared the previous generation");
            }
            return Ok(0);
        }
        self.warehouse.ensure_table(target).await?;

        let total = statements.len();
        let mut rows_affected = 0;
        for (batch, statement) in statements.iter().enumerate() {
            let affected = with_retry(&self.retry, "writer.merge", || self.warehouse.merge(statement))
                .await
                .map_err(|e| {
                    warn!(batch, committed_batches = batch, rows_affected, error = %e, "Merge batch failed");
                    e
                })?;
            rows_affected += affected;
            debug!(batch, total, affected, "Merge batch committed");
        }

        let rows_removed = with_retry(&self.retry, "writer.merge_cleanup", || {
            self.warehouse.delete_rows(&stale)
        })
        .await?;

        info!(rows_affected, rows_removed, batches = total, "Merge write complete");
        Ok(rows_affected)
    }

    /// Writes `rows` in the given mode and returns the rows now present
    /// for this write.
    pub async fn write(
        &self,
        mode: WriteMode,
        target: &TableRef,
        key: &LineageKey,
        merge_keys: &[String],
        rows: Vec<Row>,
        run_id: &str,
    ) -> Result<u64> {
        match mode {
            WriteMode::Merge => self.write_with_merge(target, key, merge_keys, rows, run_id).await,
            WriteMode::Dedup => Ok(self
                .write_with_dedup(target, key, rows, run_id)
                .await?
                .rows_inserted),
        }
    }
}

impl std::fmt::Debug for IdempotentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentWriter")
            .field("merge_batch_size", &self.merge_batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
