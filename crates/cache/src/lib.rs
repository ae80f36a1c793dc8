//! Ephemeral key/value cache with TTLs and atomic set-if-absent. Admission
//! uses it for cross-instance in-flight markers; values are small strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Atomically set `key` if absent. Returns true when this call created
    /// the entry, false when a live entry already existed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool;

    async fn get(&self, key: &str) -> Option<String>;

    async fn del(&self, key: &str);
}

/// In-process cache with lazy expiry. One per service instance; a networked
/// implementation of [`Cache`] slots in behind the same trait.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        match entries.get(key) {
            Some(_) => false,
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn del(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

/// Key of the in-flight admission marker for a data item id.
pub fn inflight_key(id: &str) -> String {
    format!("inflight:{id}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_deleted() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.set_nx("inflight:a", "1", ttl).await);
        assert!(!cache.set_nx("inflight:a", "2", ttl).await);
        assert_eq!(cache.get("inflight:a").await.as_deref(), Some("1"));

        cache.del("inflight:a").await;
        assert!(cache.set_nx("inflight:a", "3", ttl).await);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("k", "v", Duration::from_millis(10)).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.set_nx("k", "v2", Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn concurrent_set_nx_admits_exactly_one() {
        let cache = Arc::new(MemoryCache::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .set_nx("inflight:race", &i.to_string(), Duration::from_secs(60))
                    .await
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
