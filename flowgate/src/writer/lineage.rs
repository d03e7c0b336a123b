//! Lineage tagging of written rows.

use crate::core::{
    LineageKey, CREDENTIAL_ID_COLUMN, INGESTED_AT_COLUMN, PIPELINE_ID_COLUMN, RUN_DATE_COLUMN,
    RUN_ID_COLUMN, TENANT_ID_COLUMN,
};
use crate::errors::Result;
use crate::warehouse::{EqFilter, Row, SelectQuery};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Stamps the lineage columns and the tenant onto every row.
///
/// Existing values in those columns are overwritten.
#[must_use]
pub fn tag_rows(rows: Vec<Row>, key: &LineageKey, run_id: &str, ingested_at: DateTime<Utc>) -> Vec<Row> {
    let run_date = key.run_date.to_string();
    let ingested_at = ingested_at.to_rfc3339();
    rows.into_iter()
        .map(|mut row| {
            row.insert(TENANT_ID_COLUMN.to_string(), Value::from(key.tenant_id.as_str()));
            row.insert(PIPELINE_ID_COLUMN.to_string(), Value::from(key.pipeline_id.as_str()));
            row.insert(CREDENTIAL_ID_COLUMN.to_string(), Value::from(key.credential_id.as_str()));
            row.insert(RUN_DATE_COLUMN.to_string(), Value::from(run_date.as_str()));
            row.insert(RUN_ID_COLUMN.to_string(), Value::from(run_id));
            row.insert(INGESTED_AT_COLUMN.to_string(), Value::from(ingested_at.as_str()));
            row
        })
        .collect()
}

/// Projects the same lineage columns [`tag_rows`] stamps as bound constants of `query`.
pub fn stamp_query(
    query: SelectQuery,
    key: &LineageKey,
    run_id: &str,
    ingested_at: DateTime<Utc>,
) -> Result<SelectQuery> {
    query
        .with_constant(TENANT_ID_COLUMN, key.tenant_id.as_str())?
        .with_constant(PIPELINE_ID_COLUMN, key.pipeline_id.as_str())?
        .with_constant(CREDENTIAL_ID_COLUMN, key.credential_id.as_str())?
        .with_constant(RUN_DATE_COLUMN, key.run_date)?
        .with_constant(RUN_ID_COLUMN, run_id)?
        .with_constant(INGESTED_AT_COLUMN, ingested_at)
}

/// `merge_keys` followed by the generation columns it does not already name.
pub(crate) fn scoped_merge_keys(merge_keys: &[String]) -> Vec<String> {
    let mut keys = merge_keys.to_vec();
    for column in [TENANT_ID_COLUMN, PIPELINE_ID_COLUMN, CREDENTIAL_ID_COLUMN, RUN_DATE_COLUMN] {
        if !keys.iter().any(|k| k == column) {
            keys.push(column.to_string());
        }
    }
    keys
}

/// Equality filters selecting one generation.
pub fn generation_filters(key: &LineageKey) -> Result<Vec<EqFilter>> {
    Ok(vec![
        EqFilter::new(TENANT_ID_COLUMN, key.tenant_id.as_str())?,
        EqFilter::new(PIPELINE_ID_COLUMN, key.pipeline_id.as_str())?,
        EqFilter::new(CREDENTIAL_ID_COLUMN, key.credential_id.as_str())?,
        EqFilter::new(RUN_DATE_COLUMN, key.run_date)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LINEAGE_COLUMNS;
    use chrono::NaiveDate;
    use serde_json::json;

    fn key() -> LineageKey {
        LineageKey::new("acme", "usage", "cred-1", NaiveDate::from_ymd_opt(2024, 5, 2).unwrap())
    }

    #[test]
    fn test_tag_rows_sets_every_lineage_column() {
        let rows = vec![json!({"cost": 1.5, "run_id": "stale"}).as_object().cloned().unwrap()];
        let tagged = tag_rows(rows, &key(), "run-b", Utc::now());

        for column in LINEAGE_COLUMNS {
            assert!(tagged[0].contains_key(column), "missing {column}");
        }
        assert_eq!(tagged[0]["run_id"], "run-b");
        assert_eq!(tagged[0]["run_date"], "2024-05-02");
        assert_eq!(tagged[0]["tenant_id"], "acme");
        assert_eq!(tagged[0]["cost"], 1.5);
    }

    #[test]
    fn test_generation_filters_match_tagged_rows() {
        let tagged = tag_rows(vec![Row::new()], &key(), "r", Utc::now());
        let filters = generation_filters(&key()).unwrap();

        assert_eq!(filters.len(), 4);
        assert!(filters.iter().all(|f| f.matches(&tagged[0])));
    }

    #[test]
    fn test_scoped_merge_keys_append_generation_columns_once() {
        let keys = scoped_merge_keys(&["resource_id".to_string(), "tenant_id".to_string()]);
        assert_eq!(
            keys,
            vec!["resource_id", "tenant_id", "pipeline_id", "credential_id", "run_date"]
        );
    }

    #[test]
    fn test_stamped_query_projects_what_tag_rows_writes() {
        let at = Utc::now();
        let source = crate::warehouse::TableRef::new("raw", "usage").unwrap();
        let query = stamp_query(SelectQuery::all(source), &key(), "run-b", at).unwrap();

        let projected = query.project(&json!({"cost": 2}).as_object().cloned().unwrap());
        let tagged = tag_rows(vec![json!({"cost": 2}).as_object().cloned().unwrap()], &key(), "run-b", at);
        assert_eq!(projected, tagged[0]);
    }
}
