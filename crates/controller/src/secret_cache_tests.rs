use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

struct CountingStore {
    fetches: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl SecretStore for CountingStore {
    async fn get_secret(&self, name: &SecretName) -> Result<SecretString, SecretError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SecretError::Unavailable {
                name: name.clone(),
                message: "timeout".into(),
            });
        }
        Ok(SecretString::new(format!("value-{n}").into()))
    }
}

fn store(fail: bool) -> Arc<CountingStore> {
    Arc::new(CountingStore {
        fetches: AtomicUsize::new(0),
        fail,
    })
}

fn name() -> SecretName {
    SecretName::new("github-webhook-secret").unwrap()
}

#[tokio::test]
async fn test_value_is_served_from_cache_within_ttl() {
    let inner = store(false);
    let cache = CachedSecretStore::new(inner.clone(), Duration::from_secs(60));

    let first = cache.get_secret(&name()).await.unwrap();
    let second = cache.get_secret(&name()).await.unwrap();

    assert_eq!(first.expose_secret(), "value-0");
    assert_eq!(second.expose_secret(), "value-0");
    assert_eq!(inner.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_value_is_refetched_after_ttl() {
    let inner = store(false);
    let cache = CachedSecretStore::new(inner.clone(), Duration::from_millis(10));

    cache.get_secret(&name()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let refreshed = cache.get_secret(&name()).await.unwrap();

    assert_eq!(refreshed.expose_secret(), "value-1");
}

#[tokio::test]
async fn test_zero_ttl_disables_caching() {
    let inner = store(false);
    let cache = CachedSecretStore::new(inner.clone(), Duration::ZERO);

    cache.get_secret(&name()).await.unwrap();
    cache.get_secret(&name()).await.unwrap();

    assert_eq!(inner.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let inner = store(true);
    let cache = CachedSecretStore::new(inner.clone(), Duration::from_secs(60));

    assert!(cache.get_secret(&name()).await.is_err());
    assert!(cache.get_secret(&name()).await.is_err());
    assert_eq!(inner.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clear_forces_refetch() {
    let inner = store(false);
    let cache = CachedSecretStore::new(inner.clone(), Duration::from_secs(60));

    cache.get_secret(&name()).await.unwrap();
    cache.clear();
    cache.get_secret(&name()).await.unwrap();

    assert_eq!(inner.fetches.load(Ordering::SeqCst), 2);
}
