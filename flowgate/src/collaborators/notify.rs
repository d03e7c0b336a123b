//! Tenant notifications.

use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Something failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Delivers notifications to a tenant's configured channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification.
    async fn notify(&self, tenant_id: &str, event: &str, severity: Severity, message: &str)
        -> Result<()>;
}

/// Delivery bound for [`notify_best_effort`].
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends a notification, logging and discarding any failure.
pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    tenant_id: &str,
    event: &str,
    severity: Severity,
    message: &str,
) {
    match tokio::time::timeout(
        NOTIFY_TIMEOUT,
        notifier.notify(tenant_id, event, severity, message),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(tenant_id, event, error = %e, "notification delivery failed");
        }
        Err(_) => {
            tracing::warn!(tenant_id, event, "notification delivery timed out");
        }
    }
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _: &str, _: &str, _: Severity, _: &str) -> Result<()> {
        Ok(())
    }
}

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient tenant.
    pub tenant_id: String,
    /// Event name.
    pub event: String,
    /// Severity.
    pub severity: Severity,
    /// Message body.
    pub message: String,
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RwLock<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.read().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, tenant_id: &str, event: &str, severity: Severity, message: &str) -> Result<()> {
        self.sent.write().push(Notification {
            tenant_id: tenant_id.to_string(),
            event: event.to_string(),
            severity,
            message: message.to_string(),
        });
        Ok(())
    }
}
