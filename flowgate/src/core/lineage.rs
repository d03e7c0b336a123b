//! Lineage keys and the mandatory lineage columns.

use crate::errors::{ConfigError, FlowgateError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column holding the owning tenant.
pub const TENANT_ID_COLUMN: &str = "tenant_id";
/// Column holding the pipeline that produced a row.
pub const PIPELINE_ID_COLUMN: &str = "pipeline_id";
/// Column holding the source credential.
pub const CREDENTIAL_ID_COLUMN: &str = "credential_id";
/// Column holding the logical run date.
pub const RUN_DATE_COLUMN: &str = "run_date";
/// Column holding the run that wrote a row.
pub const RUN_ID_COLUMN: &str = "run_id";
/// Column holding the ingestion timestamp.
pub const INGESTED_AT_COLUMN: &str = "ingested_at";

/// The five lineage fields every written row must carry.
pub const LINEAGE_COLUMNS: [&str; 5] = [
    PIPELINE_ID_COLUMN,
    CREDENTIAL_ID_COLUMN,
    RUN_DATE_COLUMN,
    RUN_ID_COLUMN,
    INGESTED_AT_COLUMN,
];

/// Identifies one logical generation of warehouse rows.
///
/// At rest, a target table holds at most one generation per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineageKey {
    /// Owning tenant.
    pub tenant_id: String,
    /// Producing pipeline.
    pub pipeline_id: String,
    /// Source credential.
    pub credential_id: String,
    /// Logical run date.
    pub run_date: NaiveDate,
}

impl LineageKey {
    /// Creates a new lineage key.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        credential_id: impl Into<String>,
        run_date: NaiveDate,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pipeline_id: pipeline_id.into(),
            credential_id: credential_id.into(),
            run_date,
        }
    }

    /// Rejects keys with blank components.
    ///
    /// A blank component would widen the delete predicate, so this is
    /// checked before every write.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            (TENANT_ID_COLUMN, &self.tenant_id),
            (PIPELINE_ID_COLUMN, &self.pipeline_id),
            (CREDENTIAL_ID_COLUMN, &self.credential_id),
        ] {
            if value.trim().is_empty() {
                return Err(FlowgateError::Config(
                    ConfigError::new(format!("lineage key field '{field}' cannot be empty"))
                        .with_field(field),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LineageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.pipeline_id, self.credential_id, self.run_date
        )
    }
}
