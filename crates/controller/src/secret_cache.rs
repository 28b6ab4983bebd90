//! TTL cache in front of a [`SecretStore`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use domain::{ExposeSecret, SecretError, SecretName, SecretStore, SecretString};
use tracing::debug;

struct Entry {
    value: SecretString,
    fetched_at: Instant,
}

/// Caches secrets for a fixed time-to-live.
///
/// Failures are never cached. A zero TTL disables caching.
pub struct CachedSecretStore {
    inner: Arc<dyn SecretStore>,
    ttl: Duration,
    entries: RwLock<HashMap<SecretName, Entry>>,
}

impl std::fmt::Debug for CachedSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSecretStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CachedSecretStore {
    pub fn new(inner: Arc<dyn SecretStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drops every cached value.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn cached(&self, name: &SecretName) -> Option<SecretString> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(name)?;
        if entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(copy(&entry.value))
    }
}

fn copy(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().into())
}

#[async_trait]
impl SecretStore for CachedSecretStore {
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError> {
        if let Some(value) = self.cached(name) {
            return Ok(value);
        }

        debug!(secret = %name, "Fetching secret");
        let value = self.inner.get_secret(name).await?;
        if !self.ttl.is_zero() {
            self.entries
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    name.clone(),
                    Entry {
                        value: copy(&value),
                        fetched_at: Instant::now(),
                    },
                );
        }
        Ok(value)
    }
}

#[cfg(test)]
#[path = "secret_cache_tests.rs"]
mod tests;
