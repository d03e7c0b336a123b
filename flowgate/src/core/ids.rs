//! Identifier generation.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a time-ordered id for pipeline and step runs.
#[must_use]
pub fn new_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Derives the deterministic key of a scheduled run.
///
/// The same `(tenant, config, slot)` always yields the same key, so a
/// scheduler re-enqueuing a slot collapses onto the existing row. Fields
/// are length-prefixed before hashing, so no two tuples share an input.
#[must_use]
pub fn scheduled_run_key(tenant_id: &str, config_id: &str, scheduled_time: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    for field in [tenant_id, config_id] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(scheduled_time.timestamp_millis().to_be_bytes());
    let result = hasher.finalize();
    format!("sr_{}", hex::encode(&result[..16]))
}
