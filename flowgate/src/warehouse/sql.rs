//! Typed parameters and parameterized statement rendering.
//!
//! Identifiers are validated and backtick-quoted; every value travels as a
//! positional `@p<n>` parameter and is never spliced into SQL text.

use crate::errors::{ConfigError, FlowgateError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid regex"));

/// One warehouse row.
pub type Row = serde_json::Map<String, Value>;

/// Rejects anything that is not a plain SQL identifier.
pub fn validate_identifier(value: &str, field: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::new(format!(
            "invalid {field} '{value}': must match [A-Za-z_][A-Za-z0-9_]*"
        ))
        .with_field(field)
        .into())
    }
}

fn quote(identifier: &str) -> String {
    format!("`{identifier}`")
}

/// A typed query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryParam {
    /// STRING
    String(String),
    /// INT64
    Int(i64),
    /// FLOAT64
    Float(f64),
    /// BOOL
    Bool(bool),
    /// DATE
    Date(NaiveDate),
    /// TIMESTAMP
    Timestamp(DateTime<Utc>),
    /// NUMERIC, carried as its decimal text.
    Numeric(String),
    /// ARRAY of one element type.
    Array(Vec<QueryParam>),
    /// A JSON document, used for rows passed to UNNEST.
    Json(Value),
    /// NULL
    Null,
}

impl QueryParam {
    /// The warehouse type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "STRING",
            Self::Int(_) => "INT64",
            Self::Float(_) => "FLOAT64",
            Self::Bool(_) => "BOOL",
            Self::Date(_) => "DATE",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Numeric(_) => "NUMERIC",
            Self::Array(_) => "ARRAY",
            Self::Json(_) => "JSON",
            Self::Null => "NULL",
        }
    }

    /// The value as it appears in a stored row.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) | Self::Numeric(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Bool(b) => Value::Bool(*b),
            Self::Date(d) => Value::String(d.to_string()),
            Self::Timestamp(t) => Value::String(t.to_rfc3339()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Json(v) => v.clone(),
            Self::Null => Value::Null,
        }
    }

    /// Infers a parameter from a JSON value.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(_) => Self::Json(value.clone()),
        }
    }
}

/// Strings print bare; everything else prints as its JSON form.
impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Value::String(s) => f.write_str(&s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDate> for QueryParam {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// A fully-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Dataset (schema).
    pub dataset: String,
    /// Table.
    pub table: String,
}

impl TableRef {
    /// Creates a validated table reference.
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let dataset = dataset.into();
        let table = table.into();
        validate_identifier(&dataset, "dataset")?;
        validate_identifier(&table, "table")?;
        Ok(Self { dataset, table })
    }

    /// Parses `dataset.table`.
    pub fn parse(qualified: &str) -> Result<Self> {
        let (dataset, table) = qualified.split_once('.').ok_or_else(|| {
            FlowgateError::config(format!("table '{qualified}' must be written as dataset.table"))
        })?;
        Self::new(dataset, table)
    }

    /// Backtick-quoted name.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("`{}.{}`", self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// `column = value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqFilter {
    /// Column name.
    pub column: String,
    /// Compared value.
    pub value: QueryParam,
}

impl EqFilter {
    /// Creates a validated filter.
    pub fn new(column: impl Into<String>, value: impl Into<QueryParam>) -> Result<Self> {
        let column = column.into();
        validate_identifier(&column, "column")?;
        Ok(Self {
            column,
            value: value.into(),
        })
    }

    /// Returns true if `row` satisfies the predicate.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column)
            .is_some_and(|v| *v == self.value.to_json())
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterizedSql {
    /// Statement text using `@p<n>` placeholders.
    pub sql: String,
    /// Parameter values, `params[n]` binds `@p<n>`.
    pub params: Vec<QueryParam>,
}

impl ParameterizedSql {
    fn push_param(&mut self, value: QueryParam) -> String {
        let placeholder = format!("@p{}", self.params.len());
        self.params.push(value);
        placeholder
    }

    fn push_where(&mut self, filters: &[EqFilter], exclusions: &[EqFilter]) {
        if filters.is_empty() && exclusions.is_empty() {
            return;
        }
        let mut clauses = Vec::with_capacity(filters.len() + exclusions.len());
        for f in filters {
            let placeholder = self.push_param(f.value.clone());
            clauses.push(format!("{} = {placeholder}", quote(&f.column)));
        }
        for f in exclusions {
            let placeholder = self.push_param(f.value.clone());
            clauses.push(format!("{} != {placeholder}", quote(&f.column)));
        }
        self.sql.push_str(" WHERE ");
        self.sql.push_str(&clauses.join(" AND "));
    }
}

/// A filtered read from one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Source table.
    pub source: TableRef,
    /// Projected columns; empty selects everything.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Conjunctive equality filters.
    #[serde(default)]
    pub filters: Vec<EqFilter>,
    /// Bound values projected as extra columns of every selected row.
    #[serde(default)]
    pub constants: Vec<EqFilter>,
}

impl SelectQuery {
    /// Selects every column of `source`.
    #[must_use]
    pub fn all(source: TableRef) -> Self {
        Self {
            source,
            columns: Vec::new(),
            filters: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// Projects `value` as `column` on every row, replacing a source column of that name.
    pub fn with_constant(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Result<Self> {
        let constant = EqFilter::new(column, value)?;
        self.constants.retain(|c| c.column != constant.column);
        self.constants.push(constant);
        Ok(self)
    }

    /// The projection of `row`, constants included.
    #[must_use]
    pub fn project(&self, row: &Row) -> Row {
        let mut projected: Row = if self.columns.is_empty() {
            row.clone()
        } else {
            self.columns
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect()
        };
        for constant in &self.constants {
            projected.insert(constant.column.clone(), constant.value.to_json());
        }
        projected
    }

    /// Restricts the projection.
    pub fn with_columns<I, S>(mut self, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            validate_identifier(&column, "column")?;
            self.columns.push(column);
        }
        Ok(self)
    }

    /// Adds an equality filter.
    #[must_use]
    pub fn with_filter(mut self, filter: EqFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Renders the statement.
    #[must_use]
    pub fn render(&self) -> ParameterizedSql {
        let mut out = ParameterizedSql {
            sql: String::new(),
            params: Vec::new(),
        };
        let overridden: Vec<&str> = self.constants.iter().map(|c| c.column.as_str()).collect();
        let mut projection: Vec<String> = if self.columns.is_empty() {
            if overridden.is_empty() {
                vec!["*".to_string()]
            } else {
                vec![format!(
                    "* EXCEPT ({})",
                    overridden.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
                )]
            }
        } else {
            self.columns
                .iter()
                .filter(|c| !overridden.contains(&c.as_str()))
                .map(|c| quote(c))
                .collect()
        };
        for constant in &self.constants {
            let placeholder = out.push_param(constant.value.clone());
            projection.push(format!("{placeholder} AS {}", quote(&constant.column)));
        }
        out.sql = format!("SELECT {} FROM {}", projection.join(", "), self.source.quoted());
        out.push_where(&self.filters, &[]);
        out
    }
}

/// Deletes the rows of one table matching every filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteStatement {
    /// Target table.
    pub target: TableRef,
    /// Conjunctive equality filters; never empty.
    pub filters: Vec<EqFilter>,
    /// Rows equal to any of these are kept.
    pub exclusions: Vec<EqFilter>,
}

impl DeleteStatement {
    /// Creates a delete; an empty filter list is rejected.
    pub fn new(target: TableRef, filters: Vec<EqFilter>) -> Result<Self> {
        if filters.is_empty() {
            return Err(FlowgateError::config(format!(
                "refusing unfiltered delete on {target}"
            )));
        }
        Ok(Self {
            target,
            filters,
            exclusions: Vec::new(),
        })
    }

    /// Keeps rows where `filter` holds, rendered as `column != value`.
    #[must_use]
    pub fn excluding(mut self, filter: EqFilter) -> Self {
        self.exclusions.push(filter);
        self
    }

    /// Returns true if the statement deletes `row`.
    ///
    /// A missing column never compares unequal, matching SQL's NULL handling.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
            && self
                .exclusions
                .iter()
                .all(|f| row.get(&f.column).is_some_and(|v| !v.is_null() && *v != f.value.to_json()))
    }

    /// Renders the statement.
    #[must_use]
    pub fn render(&self) -> ParameterizedSql {
        let mut out = ParameterizedSql {
            sql: format!("DELETE FROM {}", self.target.quoted()),
            params: Vec::new(),
        };
        out.push_where(&self.filters, &self.exclusions);
        out
    }
}

/// An atomic upsert of a batch of rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeStatement {
    /// Target table.
    pub target: TableRef,
    /// Columns identifying a row.
    pub merge_keys: Vec<String>,
    /// Every column present in `rows`, sorted.
    pub columns: Vec<String>,
    /// The rows to upsert.
    pub rows: Vec<Row>,
}

impl MergeStatement {
    /// Builds a merge, validating keys and column names.
    pub fn new(target: TableRef, merge_keys: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        if merge_keys.is_empty() {
            return Err(ConfigError::new("merge requires at least one merge key")
                .with_field("merge_keys")
                .into());
        }
        for key in &merge_keys {
            validate_identifier(key, "merge key")?;
        }

        let mut columns = BTreeSet::new();
        for (index, row) in rows.iter().enumerate() {
            for key in &merge_keys {
                if row.get(key).map_or(true, Value::is_null) {
                    return Err(FlowgateError::config(format!(
                        "row {index} has no value for merge key '{key}'"
                    )));
                }
            }
            for column in row.keys() {
                if !columns.contains(column) {
                    validate_identifier(column, "column")?;
                    columns.insert(column.clone());
                }
            }
        }

        Ok(Self {
            target,
            merge_keys,
            columns: columns.into_iter().collect(),
            rows,
        })
    }

    /// Renders the fallback statement; the rows bind as `@p0`.
    #[must_use]
    pub fn render(&self) -> ParameterizedSql {
        let on = self
            .merge_keys
            .iter()
            .map(|k| format!("T.{0} = S.{0}", quote(k)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let updates = self
            .columns
            .iter()
            .filter(|c| !self.merge_keys.contains(c))
            .map(|c| format!("{0} = S.{0}", quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_columns = self.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let insert_values = self
            .columns
            .iter()
            .map(|c| format!("S.{}", quote(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut out = ParameterizedSql {
            sql: String::new(),
            params: Vec::new(),
        };
        let rows = out.push_param(QueryParam::Array(
            self.rows
                .iter()
                .map(|r| QueryParam::Json(Value::Object(r.clone())))
                .collect(),
        ));

        let mut sql = format!(
            "MERGE {} T USING UNNEST({rows}) S ON {on}",
            self.target.quoted()
        );
        if !updates.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {updates}"));
        }
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({insert_columns}) VALUES ({insert_values})"
        ));
        out.sql = sql;
        out
    }

    /// The merge-key tuple of `row`.
    #[must_use]
    pub fn key_of(&self, row: &Row) -> Vec<Value> {
        self.merge_keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Statistics reported by a query job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Rows written to the destination.
    pub rows_written: u64,
    /// Bytes scanned.
    pub bytes_processed: u64,
}

impl std::ops::AddAssign for QueryStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_written += rhs.rows_written;
        self.bytes_processed += rhs.bytes_processed;
    }
}
