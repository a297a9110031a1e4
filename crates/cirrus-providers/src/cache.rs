//! A small TTL cache shared by the providers
//!
//! Entries expire lazily on read. Values are cloned out, so callers keep
//! cheaply clonable types (or `Arc`s) in here.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    expires_at: Instant,
    value: V,
}

/// String-keyed cache with a per-cache default TTL
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache with the given default TTL
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Get a live value, removing it if expired
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert with the default TTL
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL
    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            Entry {
                expires_at: Instant::now() + ttl,
                value,
            },
        );
    }

    /// Remove an entry
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_lazily() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(10));
        cache.insert("k", 1);
        assert_eq!(cache.get("k"), Some(1));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn invalidate_removes() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("k", 1);
        cache.invalidate("k");
        assert_eq!(cache.get("k"), None);
    }
}
