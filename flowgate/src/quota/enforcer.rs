//! Admission control over a [`QuotaStore`].

use super::{Admission, QuotaLimits, QuotaStore};
use crate::cancellation::FinalizeGuard;
use crate::core::QuotaRecord;
use crate::errors::Result;
use crate::retry::{with_retry, RetryConfig};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Checks and reserves tenant quota.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn QuotaStore>,
    defaults: QuotaLimits,
    overrides: Arc<DashMap<String, QuotaLimits>>,
    retry: RetryConfig,
}

impl QuotaEnforcer {
    /// Creates an enforcer applying `defaults` to tenants without overrides.
    #[must_use]
    pub fn new(store: Arc<dyn QuotaStore>, defaults: QuotaLimits, retry: RetryConfig) -> Self {
        Self {
            store,
            defaults,
            overrides: Arc::new(DashMap::new()),
            retry,
        }
    }

    /// Overrides the limits of one tenant.
    pub fn set_tenant_limits(&self, tenant_id: &str, limits: QuotaLimits) {
        self.overrides.insert(tenant_id.to_string(), limits);
    }

    /// The limits in force for `tenant_id`.
    #[must_use]
    pub fn limits_for(&self, tenant_id: &str) -> QuotaLimits {
        self.overrides
            .get(tenant_id)
            .map_or(self.defaults, |l| *l)
    }

    /// Checks today's counters and reserves a slot on admission.
    pub async fn check_and_reserve(&self, tenant_id: &str) -> Result<Admission> {
        self.check_and_reserve_on(tenant_id, Utc::now().date_naive()).await
    }

    /// Like [`check_and_reserve`](Self::check_and_reserve) for an explicit usage date.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn check_and_reserve_on(&self, tenant_id: &str, usage_date: NaiveDate) -> Result<Admission> {
        let limits = self.limits_for(tenant_id);
        let admission = with_retry(&self.retry, "quota.reserve", || {
            self.store.try_reserve(tenant_id, usage_date, &limits)
        })
        .await?;

        match admission.limit_kind() {
            None => debug!("admitted"),
            Some(kind) => info!(limit = %kind, "admission denied"),
        }
        Ok(admission)
    }

    /// Reserves a slot, failing with `AdmissionDenied` when a limit is hit.
    ///
    /// The returned permit frees the slot when released or dropped.
    pub async fn admit(&self, tenant_id: &str) -> Result<QuotaPermit> {
        self.check_and_reserve(tenant_id).await?.into_result(tenant_id)?;
        Ok(QuotaPermit::new(self.clone(), tenant_id))
    }

    /// Frees one concurrency slot of `tenant_id`.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn release(&self, tenant_id: &str) -> Result<()> {
        with_retry(&self.retry, "quota.release", || self.store.release(tenant_id)).await?;
        debug!("slot released");
        Ok(())
    }

    /// Current counters of `tenant_id` for `usage_date`.
    pub async fn usage(&self, tenant_id: &str, usage_date: NaiveDate) -> Result<Option<QuotaRecord>> {
        self.store.usage(tenant_id, usage_date).await
    }
}

impl std::fmt::Debug for QuotaEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEnforcer")
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

/// A reserved concurrency slot.
///
/// Call [`QuotaPermit::release`] on the normal path. A permit dropped
/// unreleased (panic, cancelled future) schedules the release on the
/// current runtime.
#[derive(Debug)]
pub struct QuotaPermit {
    tenant_id: String,
    guard: FinalizeGuard,
}

impl QuotaPermit {
    fn new(enforcer: QuotaEnforcer, tenant_id: &str) -> Self {
        let tenant = tenant_id.to_string();
        let guard = FinalizeGuard::new("quota_permit", move || {
            async move {
                if let Err(e) = enforcer.release(&tenant).await {
                    warn!(tenant_id = %tenant, error = %e, "failed to release quota slot");
                }
            }
            .boxed()
        });
        Self {
            tenant_id: tenant_id.to_string(),
            guard,
        }
    }

    /// The tenant holding the slot.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Frees the slot.
    pub async fn release(self) {
        self.guard.finalize().await;
    }
}
