//! In-memory [`QuotaStore`].

use super::{Admission, QuotaLimits, QuotaStore};
use crate::core::QuotaRecord;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// A [`QuotaStore`] in process memory.
///
/// The mutex is held across the check and the increment, standing in for
/// the storage-level conditional update.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    rows: Mutex<BTreeMap<(String, NaiveDate), QuotaRecord>>,
}

impl MemoryQuotaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row.
    pub fn put(&self, record: QuotaRecord) {
        self.rows
            .lock()
            .insert((record.tenant_id.clone(), record.usage_date), record);
    }
}

fn latest_before<'a>(
    rows: &'a BTreeMap<(String, NaiveDate), QuotaRecord>,
    tenant_id: &str,
    date: NaiveDate,
) -> Option<&'a QuotaRecord> {
    rows.range((tenant_id.to_string(), NaiveDate::MIN)..(tenant_id.to_string(), date))
        .next_back()
        .map(|(_, r)| r)
}

fn new_row(
    rows: &BTreeMap<(String, NaiveDate), QuotaRecord>,
    tenant_id: &str,
    usage_date: NaiveDate,
    limits: &QuotaLimits,
) -> QuotaRecord {
    let previous = latest_before(rows, tenant_id, usage_date);
    QuotaRecord {
        tenant_id: tenant_id.to_string(),
        usage_date,
        daily_count: 0,
        monthly_count: previous
            .filter(|p| same_month(p.usage_date, usage_date))
            .map_or(0, |p| p.monthly_count),
        concurrent_count: previous.map_or(0, |p| p.concurrent_count),
        daily_limit: limits.daily,
        monthly_limit: limits.monthly,
        concurrent_limit: limits.concurrent,
    }
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn try_reserve(&self, tenant_id: &str, usage_date: NaiveDate, limits: &QuotaLimits) -> Result<Admission> {
        let mut rows = self.rows.lock();
        let key = (tenant_id.to_string(), usage_date);

        let fresh = new_row(&rows, tenant_id, usage_date, limits);
        let row = rows.entry(key).or_insert(fresh);
        row.daily_limit = limits.daily;
        row.monthly_limit = limits.monthly;
        row.concurrent_limit = limits.concurrent;

        if row.daily_count >= row.daily_limit {
            return Ok(Admission::DailyExceeded {
                current: row.daily_count,
                limit: row.daily_limit,
            });
        }
        if row.monthly_count >= row.monthly_limit {
            return Ok(Admission::MonthlyExceeded {
                current: row.monthly_count,
                limit: row.monthly_limit,
            });
        }
        if row.concurrent_count >= row.concurrent_limit {
            return Ok(Admission::ConcurrentExceeded {
                current: row.concurrent_count,
                limit: row.concurrent_limit,
            });
        }

        row.daily_count += 1;
        row.monthly_count += 1;
        row.concurrent_count += 1;
        Ok(Admission::Admitted)
    }

    async fn release(&self, tenant_id: &str) -> Result<()> {
        let mut rows = self.rows.lock();
        let latest = rows
            .range_mut((tenant_id.to_string(), NaiveDate::MIN)..=(tenant_id.to_string(), NaiveDate::MAX))
            .next_back();
        if let Some((_, row)) = latest {
            row.concurrent_count = row.concurrent_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn usage(&self, tenant_id: &str, usage_date: NaiveDate) -> Result<Option<QuotaRecord>> {
        Ok(self
            .rows
            .lock()
            .get(&(tenant_id.to_string(), usage_date))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(daily: u64, monthly: u64, concurrent: u64) -> QuotaLimits {
        QuotaLimits {
            daily,
            monthly,
            concurrent,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_until_concurrent_limit() {
        let store = MemoryQuotaStore::new();
        let l = limits(10, 100, 2);
        let today = day(2024, 3, 10);

        assert!(store.try_reserve("acme", today, &l).await.unwrap().is_admitted());
        assert!(store.try_reserve("acme", today, &l).await.unwrap().is_admitted());
        assert_eq!(
            store.try_reserve("acme", today, &l).await.unwrap(),
            Admission::ConcurrentExceeded { current: 2, limit: 2 }
        );

        store.release("acme").await.unwrap();
        assert!(store.try_reserve("acme", today, &l).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_daily_limit_resets_on_new_date() {
        let store = MemoryQuotaStore::new();
        let l = limits(1, 100, 5);

        assert!(store.try_reserve("acme", day(2024, 3, 10), &l).await.unwrap().is_admitted());
        store.release("acme").await.unwrap();
        assert_eq!(
            store.try_reserve("acme", day(2024, 3, 10), &l).await.unwrap(),
            Admission::DailyExceeded { current: 1, limit: 1 }
        );
        assert!(store.try_reserve("acme", day(2024, 3, 11), &l).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_new_date_carries_monthly_and_concurrent() {
        let store = MemoryQuotaStore::new();
        let l = limits(10, 100, 5);

        store.try_reserve("acme", day(2024, 3, 30), &l).await.unwrap();
        store.try_reserve("acme", day(2024, 3, 31), &l).await.unwrap();

        let row = store.usage("acme", day(2024, 3, 31)).await.unwrap().unwrap();
        assert_eq!(row.daily_count, 1);
        assert_eq!(row.monthly_count, 2);
        assert_eq!(row.concurrent_count, 2);

        store.try_reserve("acme", day(2024, 4, 1), &l).await.unwrap();
        let row = store.usage("acme", day(2024, 4, 1)).await.unwrap().unwrap();
        assert_eq!(row.monthly_count, 1);
        assert_eq!(row.concurrent_count, 3);
    }

    #[tokio::test]
    async fn test_monthly_limit() {
        let store = MemoryQuotaStore::new();
        let l = limits(10, 1, 5);
        store.try_reserve("acme", day(2024, 3, 1), &l).await.unwrap();
        assert_eq!(
            store.try_reserve("acme", day(2024, 3, 2), &l).await.unwrap().limit_kind(),
            Some(super::super::LimitKind::Monthly)
        );
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let store = MemoryQuotaStore::new();
        let l = limits(10, 100, 1);
        let today = day(2024, 3, 10);

        assert!(store.try_reserve("a", today, &l).await.unwrap().is_admitted());
        assert!(store.try_reserve("b", today, &l).await.unwrap().is_admitted());
        store.release("c").await.unwrap();
        assert_eq!(store.usage("a", today).await.unwrap().unwrap().concurrent_count, 1);
    }
}
