//! Partitioned jobs and batch planning.

use crate::errors::{ConfigError, Result};
use crate::warehouse::{validate_identifier, EqFilter, QueryParam, SelectQuery, TableRef};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A query split by the distinct values of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionJob {
    /// Table read by every partition.
    pub source: TableRef,
    /// Column whose distinct values define the partitions.
    pub partition_field: String,
    /// Table every partition appends to.
    pub destination: TableRef,
    /// The unpartitioned query.
    pub base: SelectQuery,
}

impl PartitionJob {
    /// Creates a job selecting every column of `source`.
    pub fn new(source: TableRef, partition_field: impl Into<String>, destination: TableRef) -> Result<Self> {
        let partition_field = partition_field.into();
        validate_identifier(&partition_field, "partition_field")?;
        Ok(Self {
            base: SelectQuery::all(source.clone()),
            source,
            partition_field,
            destination,
        })
    }

    /// Replaces the base query; it must read from the job's source.
    pub fn with_base_query(mut self, base: SelectQuery) -> Result<Self> {
        if base.source != self.source {
            return Err(ConfigError::new(format!(
                "base query reads {} but the job partitions {}",
                base.source, self.source
            ))
            .with_field("source")
            .into());
        }
        self.base = base;
        Ok(self)
    }

    /// The base query restricted to one partition value, bound with its own type.
    pub fn partition_query(&self, value: &QueryParam) -> Result<SelectQuery> {
        let filter = EqFilter::new(self.partition_field.clone(), value.clone())?;
        Ok(self.base.clone().with_filter(filter))
    }
}

/// Tuning for one partitioned execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOptions {
    /// Partitions per batch, and the cap on concurrent partition tasks.
    pub batch_size: usize,
    /// First batch to run; earlier batches are assumed committed.
    pub resume_from_batch: usize,
    /// How long in-flight tasks may run after cancellation.
    pub grace_period: Duration,
}

impl PartitionOptions {
    /// Options running every batch.
    #[must_use]
    pub fn new(batch_size: usize, grace_period: Duration) -> Self {
        Self {
            batch_size,
            resume_from_batch: 0,
            grace_period,
        }
    }

    /// Resumes at `batch`.
    #[must_use]
    pub fn resume_from(mut self, batch: usize) -> Self {
        self.resume_from_batch = batch;
        self
    }
}

/// Splits `partitions` into consecutive batches of `batch_size`.
///
/// Only the last batch may be shorter.
pub fn plan_batches<T: Clone>(partitions: &[T], batch_size: usize) -> Result<Vec<Vec<T>>> {
    if batch_size == 0 {
        return Err(ConfigError::new("batch_size must be at least 1")
            .with_field("batch_size")
            .into());
    }
    Ok(partitions.chunks(batch_size).map(<[T]>::to_vec).collect())
}
