//! The analytical warehouse collaborator.
//!
//! The engine only needs a handful of operations: existence checks,
//! create/truncate, filtered delete, streaming insert, an atomic merge, a
//! distinct-values read, and a filtered query whose results land in a
//! destination table. Every statement carries its values as typed
//! parameters.

mod memory;
mod sql;

pub use memory::{MemoryWarehouse, WarehouseOp};
pub use sql::{
    validate_identifier, DeleteStatement, EqFilter, MergeStatement, ParameterizedSql, QueryParam,
    QueryStats, Row, SelectQuery, TableRef,
};

use crate::errors::Result;
use async_trait::async_trait;

/// A columnar, SQL-queryable analytical store.
///
/// Implementations report affected-row counts for DML and map retryable
/// failures (rate limits, 5xx) to `FlowgateError::TransientStorage`.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Returns true if `table` exists.
    async fn table_exists(&self, table: &TableRef) -> Result<bool>;

    /// Creates `table`, creating its dataset when needed.
    ///
    /// Creating an existing table is not an error.
    async fn create_table(&self, table: &TableRef) -> Result<()>;

    /// Removes every row of `table`.
    async fn truncate_table(&self, table: &TableRef) -> Result<()>;

    /// Deletes matching rows and returns how many were removed.
    async fn delete_rows(&self, statement: &DeleteStatement) -> Result<u64>;

    /// Appends rows and returns how many were inserted.
    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<u64>;

    /// Applies the merge atomically and returns the affected-row count.
    ///
    /// Either every row of the statement is applied or none is.
    async fn merge(&self, statement: &MergeStatement) -> Result<u64>;

    /// Distinct non-null values of `column`, ordered ascending.
    ///
    /// Values keep the column's type so they can be bound back as filters.
    async fn distinct_values(&self, table: &TableRef, column: &str) -> Result<Vec<QueryParam>>;

    /// Runs `query` and appends its result to `destination`.
    async fn query_into(&self, query: &SelectQuery, destination: &TableRef) -> Result<QueryStats>;

    /// Creates `table` if it does not exist.
    async fn ensure_table(&self, table: &TableRef) -> Result<()> {
        if !self.table_exists(table).await? {
            self.create_table(table).await?;
        }
        Ok(())
    }
}
