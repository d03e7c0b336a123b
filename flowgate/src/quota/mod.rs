//! Tenant quota admission.
//!
//! Admission checks the daily, monthly and concurrent limits of a tenant
//! once, at admission time, and reserves a concurrency slot with a single
//! conditional write at the storage layer. Daily and monthly counters are
//! keyed by usage date, so a new date starts fresh counters without a
//! reset job.

mod enforcer;
mod memory;

pub use enforcer::{QuotaEnforcer, QuotaPermit};
pub use memory::MemoryQuotaStore;

use crate::core::QuotaRecord;
use crate::errors::{FlowgateError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which limit a denial hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Runs per day.
    Daily,
    /// Runs per calendar month.
    Monthly,
    /// Runs executing at once.
    Concurrent,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
            Self::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Per-tenant limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Runs per day.
    pub daily: u64,
    /// Runs per calendar month.
    pub monthly: u64,
    /// Runs executing at once.
    pub concurrent: u64,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved.
    Admitted,
    /// The daily limit is reached.
    DailyExceeded {
        /// Runs admitted today.
        current: u64,
        /// The limit.
        limit: u64,
    },
    /// The monthly limit is reached.
    MonthlyExceeded {
        /// Runs admitted this month.
        current: u64,
        /// The limit.
        limit: u64,
    },
    /// Every concurrency slot is taken.
    ConcurrentExceeded {
        /// Runs executing now.
        current: u64,
        /// The limit.
        limit: u64,
    },
}

impl Admission {
    /// Returns true if a slot was reserved.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// The limit that denied admission, if any.
    #[must_use]
    pub const fn limit_kind(&self) -> Option<LimitKind> {
        match self {
            Self::Admitted => None,
            Self::DailyExceeded { .. } => Some(LimitKind::Daily),
            Self::MonthlyExceeded { .. } => Some(LimitKind::Monthly),
            Self::ConcurrentExceeded { .. } => Some(LimitKind::Concurrent),
        }
    }

    /// Converts a denial into [`FlowgateError::AdmissionDenied`].
    pub fn into_result(self, tenant_id: &str) -> Result<()> {
        let (limit, current, limit_value) = match self {
            Self::Admitted => return Ok(()),
            Self::DailyExceeded { current, limit } => (LimitKind::Daily, current, limit),
            Self::MonthlyExceeded { current, limit } => (LimitKind::Monthly, current, limit),
            Self::ConcurrentExceeded { current, limit } => (LimitKind::Concurrent, current, limit),
        };
        Err(FlowgateError::AdmissionDenied {
            tenant_id: tenant_id.to_string(),
            limit,
            current,
            limit_value,
        })
    }
}

/// Storage for quota counters.
///
/// `try_reserve` and `release` must each be one atomic conditional write
/// (for SQL: `UPDATE ... SET concurrent_count = concurrent_count + 1
/// WHERE ... AND concurrent_count < concurrent_limit`), so admission stays
/// correct with many workers admitting at once.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Checks the counters of `usage_date` against `limits` and, when every
    /// limit has room, increments the daily, monthly and concurrent
    /// counters.
    ///
    /// A missing row is created first: daily starts at zero, monthly is
    /// carried from the latest row of the same month, concurrent from the
    /// latest row.
    async fn try_reserve(&self, tenant_id: &str, usage_date: NaiveDate, limits: &QuotaLimits) -> Result<Admission>;

    /// Decrements the concurrent counter of the tenant's latest row.
    async fn release(&self, tenant_id: &str) -> Result<()>;

    /// The row for `usage_date`, if one exists.
    async fn usage(&self, tenant_id: &str, usage_date: NaiveDate) -> Result<Option<QuotaRecord>>;
}
