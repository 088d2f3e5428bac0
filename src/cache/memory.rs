use super::CacheBackend;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// In-process TTL map.
///
/// Entries past `expires_at` are invisible to `get` and are removed either on
/// that access or by the next `sweep`. Writers for the same key race and the
/// last one wins.
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheBackend<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }

        // The read guard is released above; a concurrent put may have
        // refreshed the entry in between, so only drop it if still stale
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    fn put(&self, key: String, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_put_and_overwrite() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k"), None);

        cache.put("k".to_string(), 1, Duration::from_secs(60));
        cache.put("k".to_string(), 2, Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_evicted_on_access() {
        let cache = MemoryCache::new();
        cache.put("gone".to_string(), "v".to_string(), Duration::ZERO);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.put("old".to_string(), 1, Duration::ZERO);
        cache.put("fresh".to_string(), 2, Duration::from_secs(60));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.put(format!("key-{}", j % 10), i, Duration::from_secs(60));
                        let _ = cache.get("key-0");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.entry_count(), 10);
    }
}
