//! Authenticator - resolves an optional API key into a quota principal.
//!
//! Lookups, found or not, are cached for a short time in front of the key
//! store so the hot path rarely touches SQLite, and a flood of bogus keys
//! cannot hammer it. Store calls run on the blocking pool. Issuing or
//! revoking a key invalidates its cache entry.

mod keystore;

pub use keystore::{ApiKey, KeyStore, SqliteKeyStore};

use crate::error::{AuthError, KeyStoreError};
use crate::limiter::{AddressScope, Identity, QuotaTier};
use chrono::Utc;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};


/// Who is making a request and what they may consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: Identity,
    pub tier: QuotaTier,
}

impl Principal {
    pub fn is_anonymous(&self) -> bool {
        matches!(self.identity, Identity::Address(_))
    }
}

/// Settings that decide how callers are authenticated.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Reject requests that carry no key.
    pub require_key: bool,
    /// Limits for callers without a key.
    pub anonymous: QuotaTier,
    /// Window length applied to per-key limits.
    pub key_window: Duration,
    pub address_scope: AddressScope,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            require_key: false,
            anonymous: QuotaTier::new(None, None, Duration::from_secs(60)),
            key_window: Duration::from_secs(60),
            address_scope: AddressScope::default(),
        }
    }
}

pub struct Authenticator {
    store: Arc<dyn KeyStore>,
    /// `None` records a key the store does not know.
    cache: Cache<String, Option<Arc<ApiKey>>>,
    policy: AuthPolicy,
}

impl Authenticator {
    pub fn new(store: Arc<dyn KeyStore>, policy: AuthPolicy) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(30))
                .build(),
            policy,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        self
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    /// Run a store call off the async workers.
    async fn with_store<T, F>(&self, op: F) -> Result<T, KeyStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyStore) -> Result<T, KeyStoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| KeyStoreError::Task(e.to_string()))?
    }

    async fn lookup(&self, key: &str) -> Result<Option<Arc<ApiKey>>, AuthError> {
        if let Some(cached) = self.cache.get(key).await {
            return Ok(cached);
        }
        let owned = key.to_string();
        let found = self
            .with_store(move |store| store.get(&owned))
            .await?
            .map(Arc::new);
        if found.is_none() {
            debug!("unknown API key cached as missing");
        }
        self.cache.insert(key.to_string(), found.clone()).await;
        Ok(found)
    }

    /// Resolve the caller. A presented key must be valid even when keys are
    /// optional; a blank key counts as no key.
    pub async fn authenticate(
        &self,
        key: Option<&str>,
        address: &str,
    ) -> Result<Principal, AuthError> {
        let key = key.map(str::trim).filter(|k| !k.is_empty());

        let Some(key) = key else {
            if self.policy.require_key {
                return Err(AuthError::MissingKey);
            }
            return Ok(Principal {
                identity: self.policy.address_scope.bucket(address),
                tier: self.policy.anonymous,
            });
        };

        let api_key = self.lookup(key).await?.ok_or(AuthError::InvalidKey)?;
        if api_key.revoked {
            return Err(AuthError::RevokedKey);
        }
        if api_key.is_expired(Utc::now()) {
            return Err(AuthError::ExpiredKey);
        }

        Ok(Principal {
            identity: Identity::Key(api_key.key.clone()),
            tier: QuotaTier::new(
                Some(api_key.req_limit),
                api_key.char_limit,
                self.policy.key_window,
            ),
        })
    }

    pub async fn issue_key(
        &self,
        req_limit: u64,
        char_limit: Option<u64>,
        expires_in: Option<Duration>,
    ) -> Result<ApiKey, AuthError> {
        let key = ApiKey::generate(req_limit, char_limit, expires_in);
        let stored = key.clone();
        self.with_store(move |store| store.insert(&stored)).await?;
        self.cache.invalidate(&key.key).await;
        info!(key = %Identity::Key(key.key.clone()), req_limit, "issued API key");
        Ok(key)
    }

    /// Revoke a key. Returns false when the key is unknown.
    pub async fn revoke(&self, key: &str) -> Result<bool, AuthError> {
        let owned = key.to_string();
        let revoked = self.with_store(move |store| store.revoke(&owned)).await?;
        self.cache.invalidate(key).await;
        if revoked {
            info!(key = %Identity::Key(key.to_string()), "revoked API key");
        } else {
            debug!("revoke of unknown key ignored");
        }
        Ok(revoked)
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKey>, AuthError> {
        Ok(self.with_store(|store| store.list()).await?)
    }
}
