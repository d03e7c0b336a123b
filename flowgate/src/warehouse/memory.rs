//! In-memory warehouse used by tests, benches and local runs.

use super::sql::{DeleteStatement, MergeStatement, ParameterizedSql, QueryParam, QueryStats, Row, SelectQuery, TableRef};
use super::Warehouse;
use crate::errors::{FlowgateError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Operations of the [`Warehouse`] trait, for fault injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarehouseOp {
    /// `table_exists`
    TableExists,
    /// `create_table`
    CreateTable,
    /// `truncate_table`
    Truncate,
    /// `delete_rows`
    Delete,
    /// `insert_rows`
    Insert,
    /// `merge`
    Merge,
    /// `distinct_values`
    DistinctValues,
    /// `query_into`
    QueryInto,
}

#[derive(Debug)]
struct Fault {
    op: WarehouseOp,
    skip: usize,
    remaining: usize,
    transient: bool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`Warehouse`] backed by process memory.
///
/// Tables are schemaless row vectors. Faults can be injected per
/// operation, and `query_into` can be slowed down and made to fail for
/// specific filter values.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<TableRef, Vec<Row>>>,
    faults: Mutex<Vec<Fault>>,
    failing_values: RwLock<HashSet<String>>,
    calls: DashMap<WarehouseOp, usize>,
    statements: Mutex<Vec<ParameterizedSql>>,
    query_latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryWarehouse {
    /// Creates an empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `query_into` take at least `latency`.
    #[must_use]
    pub fn with_query_latency(mut self, latency: Duration) -> Self {
        self.query_latency = Some(latency);
        self
    }

    /// Creates `table` holding `rows`, replacing any previous content.
    pub fn seed(&self, table: &TableRef, rows: Vec<Row>) {
        self.tables.write().insert(table.clone(), rows);
    }

    /// A snapshot of the rows of `table`; empty if it does not exist.
    #[must_use]
    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Fails the next `times` calls of `op`.
    pub fn inject_failures(&self, op: WarehouseOp, times: usize, transient: bool) {
        self.inject_failures_after(op, 0, times, transient);
    }

    /// Lets `skip` calls of `op` through, then fails the next `times`.
    pub fn inject_failures_after(&self, op: WarehouseOp, skip: usize, times: usize, transient: bool) {
        self.faults.lock().push(Fault {
            op,
            skip,
            remaining: times,
            transient,
        });
    }

    /// Makes `query_into` fail whenever a filter compares against `value`.
    pub fn fail_partition(&self, value: impl Into<QueryParam>) {
        self.failing_values.write().insert(value.into().to_string());
    }

    /// How many times `op` was called.
    #[must_use]
    pub fn call_count(&self, op: WarehouseOp) -> usize {
        self.calls.get(&op).map_or(0, |c| *c)
    }

    /// Highest number of `query_into` calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Rendered statements, in submission order.
    #[must_use]
    pub fn statements(&self) -> Vec<ParameterizedSql> {
        self.statements.lock().clone()
    }

    fn enter(&self, op: WarehouseOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        let mut faults = self.faults.lock();
        if let Some(fault) = faults.iter_mut().find(|f| f.op == op && f.remaining > 0) {
            if fault.skip > 0 {
                fault.skip -= 1;
                return Ok(());
            }
            fault.remaining -= 1;
            let message = format!("injected failure in {op:?}");
            return Err(if fault.transient {
                FlowgateError::transient(message)
            } else {
                FlowgateError::storage(message)
            });
        }
        Ok(())
    }

    fn record(&self, statement: ParameterizedSql) {
        self.statements.lock().push(statement);
    }
}

fn not_found(table: &TableRef) -> FlowgateError {
    FlowgateError::NotFound(format!("table {table}"))
}

/// Numbers sort numerically, strings lexically; mixed types group by kind.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or_default()
                .total_cmp(&y.as_f64().unwrap_or_default()),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn row_bytes(row: &Row) -> u64 {
    serde_json::to_vec(row).map_or(0, |b| b.len() as u64)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        self.enter(WarehouseOp::TableExists)?;
        Ok(self.tables.read().contains_key(table))
    }

    async fn create_table(&self, table: &TableRef) -> Result<()> {
        self.enter(WarehouseOp::CreateTable)?;
        self.tables.write().entry(table.clone()).or_default();
        Ok(())
    }

    async fn truncate_table(&self, table: &TableRef) -> Result<()> {
        self.enter(WarehouseOp::Truncate)?;
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        rows.clear();
        Ok(())
    }

    async fn delete_rows(&self, statement: &DeleteStatement) -> Result<u64> {
        self.enter(WarehouseOp::Delete)?;
        self.record(statement.render());

        let mut tables = self.tables.write();
        let rows = tables
            .get_mut(&statement.target)
            .ok_or_else(|| not_found(&statement.target))?;
        let before = rows.len();
        rows.retain(|row| !statement.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<u64> {
        self.enter(WarehouseOp::Insert)?;
        let mut tables = self.tables.write();
        let target = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        target.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn merge(&self, statement: &MergeStatement) -> Result<u64> {
        self.enter(WarehouseOp::Merge)?;
        self.record(statement.render());

        let mut tables = self.tables.write();
        let target = tables
            .get_mut(&statement.target)
            .ok_or_else(|| not_found(&statement.target))?;

        let mut index: HashMap<String, usize> = HashMap::with_capacity(target.len());
        for (i, row) in target.iter().enumerate() {
            index.insert(Value::from(statement.key_of(row)).to_string(), i);
        }

        for row in &statement.rows {
            let key = Value::from(statement.key_of(row)).to_string();
            match index.get(&key) {
                Some(&i) => {
                    for (column, value) in row {
                        target[i].insert(column.clone(), value.clone());
                    }
                }
                None => {
                    index.insert(key, target.len());
                    target.push(row.clone());
                }
            }
        }
        Ok(statement.rows.len() as u64)
    }

    async fn distinct_values(&self, table: &TableRef, column: &str) -> Result<Vec<QueryParam>> {
        self.enter(WarehouseOp::DistinctValues)?;
        let tables = self.tables.read();
        let rows = tables.get(table).ok_or_else(|| not_found(table))?;

        let mut values: Vec<&Value> = rows
            .iter()
            .filter_map(|row| row.get(column))
            .filter(|v| !v.is_null())
            .collect();
        values.sort_by(|a, b| compare_values(a, b));
        values.dedup();
        Ok(values.into_iter().map(QueryParam::from_json).collect())
    }

    async fn query_into(&self, query: &SelectQuery, destination: &TableRef) -> Result<QueryStats> {
        self.enter(WarehouseOp::QueryInto)?;
        self.record(query.render());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.query_latency {
            tokio::time::sleep(latency).await;
        }

        {
            let failing = self.failing_values.read();
            if let Some(filter) = query
                .filters
                .iter()
                .find(|f| failing.contains(&f.value.to_string()))
            {
                return Err(FlowgateError::storage(format!(
                    "query failed for {} = {}",
                    filter.column, filter.value
                )));
            }
        }

        let mut tables = self.tables.write();
        let source = tables.get(&query.source).ok_or_else(|| not_found(&query.source))?;

        let mut stats = QueryStats::default();
        let selected: Vec<Row> = source
            .iter()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .map(|row| {
                stats.bytes_processed += row_bytes(row);
                query.project(row)
            })
            .collect();
        stats.rows_written = selected.len() as u64;

        let target = tables.get_mut(destination).ok_or_else(|| not_found(destination))?;
        target.extend(selected);
        Ok(stats)
    }
}

impl std::fmt::Debug for MemoryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWarehouse")
            .field("tables", &self.tables.read().len())
            .field("query_latency", &self.query_latency)
            .finish_non_exhaustive()
    }
}
