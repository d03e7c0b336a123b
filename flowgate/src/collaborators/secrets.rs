//! Credentials fetched per step and dropped afterwards.

use crate::errors::{FlowgateError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A decrypted credential and how long it may be held.
#[derive(Clone)]
pub struct Credential {
    /// Provider the credential belongs to, e.g. `aws`.
    pub provider: String,
    secret: String,
    /// Recommended time to live.
    pub ttl: Duration,
}

impl Credential {
    /// Creates a credential.
    #[must_use]
    pub fn new(provider: impl Into<String>, secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            provider: provider.into(),
            secret: secret.into(),
            ttl,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Resolves decrypted credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns the credential `tenant_id` holds for `provider`.
    async fn fetch(&self, tenant_id: &str, provider: &str) -> Result<Credential>;
}

struct Lease {
    credential: Credential,
    expires_at: Instant,
}

/// Shared access to a leased credential.
///
/// Reads fail once the TTL has passed or the lease was cleared; clearing
/// affects every clone of the handle.
#[derive(Clone)]
pub struct CredentialHandle {
    inner: Arc<RwLock<Option<Lease>>>,
}

impl CredentialHandle {
    /// Leases `credential` starting now.
    #[must_use]
    pub fn lease(credential: Credential) -> Self {
        let expires_at = Instant::now() + credential.ttl;
        Self {
            inner: Arc::new(RwLock::new(Some(Lease {
                credential,
                expires_at,
            }))),
        }
    }

    /// The secret value.
    pub fn secret(&self) -> Result<String> {
        let guard = self.inner.read();
        let lease = guard
            .as_ref()
            .ok_or_else(|| FlowgateError::Internal("credential lease was cleared".to_string()))?;
        if Instant::now() >= lease.expires_at {
            return Err(FlowgateError::Internal(format!(
                "credential for '{}' expired",
                lease.credential.provider
            )));
        }
        Ok(lease.credential.secret.clone())
    }

    /// The provider name, while the lease is held.
    #[must_use]
    pub fn provider(&self) -> Option<String> {
        self.inner.read().as_ref().map(|l| l.credential.provider.clone())
    }

    /// Drops the credential for every holder.
    pub fn clear(&self) {
        if let Some(mut lease) = self.inner.write().take() {
            lease.credential.secret.clear();
        }
    }

    /// Returns true once cleared.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.inner.read().is_none()
    }
}

impl std::fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("provider", &self.provider())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

/// A [`SecretProvider`] with fixed credentials.
#[derive(Debug, Default)]
pub struct StaticSecretProvider {
    secrets: RwLock<HashMap<(String, String), Credential>>,
}

impl StaticSecretProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a credential.
    pub fn insert(&self, tenant_id: &str, credential: Credential) {
        self.secrets
            .write()
            .insert((tenant_id.to_string(), credential.provider.clone()), credential);
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn fetch(&self, tenant_id: &str, provider: &str) -> Result<Credential> {
        self.secrets
            .read()
            .get(&(tenant_id.to_string(), provider.to_string()))
            .cloned()
            .ok_or_else(|| {
                FlowgateError::NotFound(format!("credential '{provider}' for tenant '{tenant_id}'"))
            })
    }
}
