use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    expires: Instant,
}

/// TTL keyed store. Expired entries read as misses; physical eviction is
/// deferred to `cleanup` so reads stay cheap.
pub(crate) struct Cache<V> {
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
    default_ttl: Duration,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

impl<V: Clone> Cache<V> {
    pub(crate) fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Default::default(),
            default_ttl,
        }
    }

    pub(crate) async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;

        if Instant::now() >= entry.expires {
            tracing::trace!(key, "Cache entry expired");
            return None;
        }

        Some(entry.value.clone())
    }

    pub(crate) async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires = Instant::now() + ttl.unwrap_or(self.default_ttl);

        let mut entries = self.entries.write().await;
        entries.insert(key.to_owned(), Entry { value, expires });
    }

    pub(crate) async fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    /// Evicts every expired entry, returning how many were dropped.
    pub(crate) async fn cleanup(&self) -> usize {
        let now = Instant::now();

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);

        before - entries.len()
    }

    pub(crate) async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expiry() {
        let cache: Cache<u32> = Cache::new(Duration::from_secs(60));

        cache.set("alive", 1, None).await;
        cache.set("dead", 2, Some(Duration::ZERO)).await;

        assert_eq!(cache.get("alive").await, Some(1));
        assert_eq!(cache.get("dead").await, None);
        assert_eq!(cache.get("missing").await, None);

        // The expired entry is still physically present until cleanup runs.
        assert_eq!(cache.cleanup().await, 1);
        assert_eq!(cache.cleanup().await, 0);
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let cache: Cache<&'static str> = Cache::new(Duration::from_secs(60));

        cache.set("one", "a", None).await;
        cache.set("two", "b", None).await;

        assert!(cache.invalidate("one").await);
        assert!(!cache.invalidate("one").await);
        assert_eq!(cache.get("one").await, None);

        cache.clear().await;
        assert_eq!(cache.get("two").await, None);
    }

    #[tokio::test]
    async fn overwrite_refreshes_value() {
        let cache: Cache<u32> = Cache::new(Duration::from_secs(60));

        cache.set("key", 1, None).await;
        cache.set("key", 2, None).await;

        assert_eq!(cache.get("key").await, Some(2));
    }
}
