//! Per-tenant credential resolution.
//!
//! Each tenant (workspace) has an installation record in the remote store
//! linking it to a bot token. Resolution is cached with a TTL so the common
//! case costs no remote call; enterprise-grid tenants share one credential
//! set keyed by the enterprise id.
//!
//! Confirmed absence of an installation falls back to the statically
//! configured credential when one exists. A transport failure is NOT
//! absence and never triggers the fallback.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::approval::store::ApprovalStore;
use relay_common::config::FallbackCredential;

/// Credentials needed to act on a tenant's behalf.
///
/// Valid only while `now - fetched_at` is under the resolver's TTL; stale
/// entries are refreshed, never served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCredential {
    pub tenant_id: String,
    pub bot_token: String,
    pub bot_id: String,
    pub bot_user_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// Why a credential could not be resolved.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The store confirmed there is no installation for this tenant.
    #[error("no installation found for tenant '{0}'")]
    NoInstallationFound(String),

    /// The lookup itself failed; retryable, and never a reason to
    /// substitute another credential.
    #[error("installation lookup unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// TTL-cached credential resolver over the installation store.
pub struct CredentialResolver {
    store: Arc<dyn ApprovalStore>,
    fallback: Option<FallbackCredential>,
    ttl: Duration,
    cache: RwLock<HashMap<String, TenantCredential>>,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        fallback: Option<FallbackCredential>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            fallback,
            ttl: Duration::seconds(ttl_secs),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the credential for a tenant.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        enterprise_id: Option<&str>,
    ) -> Result<TenantCredential, ResolutionError> {
        self.resolve_at(tenant_id, enterprise_id, Utc::now()).await
    }

    /// Resolve with an explicit clock.
    pub async fn resolve_at(
        &self,
        tenant_id: &str,
        enterprise_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TenantCredential, ResolutionError> {
        // Enterprise-grid tenants share one credential set across member
        // workspaces.
        let key = enterprise_id.unwrap_or(tenant_id);

        if let Some(cached) = self.cache.read().await.get(key) {
            if now - cached.fetched_at < self.ttl {
                return Ok(cached.clone());
            }
        }

        let installation = self
            .store
            .installation(tenant_id)
            .await
            .map_err(|e| ResolutionError::UpstreamUnavailable(e.to_string()))?;

        match installation {
            Some(installation) => {
                let credential = TenantCredential {
                    tenant_id: installation.tenant_id,
                    bot_token: installation.bot_token,
                    bot_id: installation.bot_id,
                    bot_user_id: installation.bot_user_id,
                    fetched_at: now,
                };

                // Last writer wins; concurrent lookups may race but each
                // writes a complete entry under its own key.
                self.cache
                    .write()
                    .await
                    .insert(key.to_string(), credential.clone());

                tracing::debug!(tenant_id = %tenant_id, cache_key = %key, "Credential refreshed");
                Ok(credential)
            }
            None => match &self.fallback {
                Some(fallback) => {
                    tracing::debug!(tenant_id = %tenant_id, "Using fallback credential");
                    Ok(TenantCredential {
                        tenant_id: tenant_id.to_string(),
                        bot_token: fallback.bot_token.clone(),
                        bot_id: fallback.bot_id.clone(),
                        bot_user_id: fallback.bot_user_id.clone(),
                        fetched_at: now,
                    })
                }
                None => Err(ResolutionError::NoInstallationFound(tenant_id.to_string())),
            },
        }
    }

    /// Cached entry for a key, if any. Test introspection.
    pub async fn cached(&self, key: &str) -> Option<TenantCredential> {
        self.cache.read().await.get(key).cloned()
    }
}
