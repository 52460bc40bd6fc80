use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Consider cache stale after 1 hour.
/// Timetables and group rosters change a few times a day at most.
const DEFAULT_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl CacheConfig {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            cached_at: Utc::now(),
        }
    }

    pub fn with_timestamp(value: T, cached_at: DateTime<Utc>) -> Self {
        Self { value, cached_at }
    }

    pub fn cached_at_millis(&self) -> i64 {
        self.cached_at.timestamp_millis()
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.cached_at
    }

    pub fn age_minutes(&self) -> i64 {
        self.age().num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    /// An entry is stale once its age reaches the TTL.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }
}

/// TTL-aware in-memory store shared by every subscriber of an entity source.
///
/// Readers always get a cloned snapshot; entries are never handed out
/// mutably. Writes for one key are sequenced by the fetch coordinator, so a
/// plain lock around the map is all the synchronization needed here.
pub struct EntityCache<K, T> {
    config: CacheConfig,
    entries: RwLock<HashMap<K, CacheEntry<T>>>,
}

impl<K, T> EntityCache<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `key`, or `None` if absent or older than the TTL.
    pub fn get(&self, key: &K) -> Option<CacheEntry<T>> {
        self.peek(key)
            .filter(|entry| !entry.is_stale(self.config.ttl))
    }

    /// Entry for `key` regardless of its age.
    pub fn peek(&self, key: &K) -> Option<CacheEntry<T>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn is_stale(&self, entry: &CacheEntry<T>) -> bool {
        entry.is_stale(self.config.ttl)
    }

    pub fn put(&self, key: K, value: T) -> CacheEntry<T> {
        self.put_entry(key, CacheEntry::new(value))
    }

    pub fn put_entry(&self, key: K, entry: CacheEntry<T>) -> CacheEntry<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, entry.clone());
        entry
    }

    /// Insert unless an entry exists; returns whichever entry is cached afterwards.
    pub fn put_if_absent(&self, key: K, value: T) -> CacheEntry<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key)
            .or_insert_with(|| CacheEntry::new(value))
            .clone()
    }

    pub fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        debug!(count = entries.len(), "Clearing entity cache");
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged<T>(value: T, minutes: i64) -> CacheEntry<T> {
        CacheEntry::with_timestamp(value, Utc::now() - Duration::minutes(minutes))
    }

    #[test]
    fn test_cache_entry_age_display() {
        assert_eq!(CacheEntry::new(1).age_display(), "just now");
        assert_eq!(aged(1, 5).age_display(), "5m ago");
        assert_eq!(aged(1, 90).age_display(), "2h ago");
        assert_eq!(aged(1, 70).age_display(), "1h ago");
        assert_eq!(aged(1, 1440 * 3).age_display(), "3d ago");

        // Clock skew: cached "in the future"
        let skewed = CacheEntry::with_timestamp(1, Utc::now() + Duration::minutes(5));
        assert_eq!(skewed.age_display(), "just now");
    }

    #[test]
    fn test_cache_entry_is_stale() {
        let ttl = Duration::minutes(60);
        assert!(!CacheEntry::new(1).is_stale(ttl));
        assert!(aged(1, 61).is_stale(ttl));
        assert!(aged(1, 60).is_stale(ttl));
    }

    #[test]
    fn test_get_hides_stale_but_peek_does_not() {
        let cache = EntityCache::new(CacheConfig::with_ttl(Duration::minutes(10)));
        cache.put_entry("group", aged("9c", 11));

        assert!(cache.get(&"group").is_none());
        let peeked = cache.peek(&"group").expect("entry still present");
        assert_eq!(peeked.value, "9c");
        assert!(cache.is_stale(&peeked));

        // Lazy expiry: reading never evicts
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_get_invalidate_clear() {
        let cache = EntityCache::new(CacheConfig::default());
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a").map(|e| e.value), Some(1));

        // Put replaces the previous entry
        cache.put("a", 3);
        assert_eq!(cache.get(&"a").map(|e| e.value), Some(3));

        assert!(cache.invalidate(&"a"));
        assert!(!cache.invalidate(&"a"));
        assert!(cache.get(&"a").is_none());

        assert_eq!(cache.put_if_absent("b", 9).value, 2);
        assert_eq!(cache.put_if_absent("c", 9).value, 9);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let cache = EntityCache::new(CacheConfig::default());
        cache.put("a", vec![1, 2]);
        let mut snapshot = cache.get(&"a").expect("cached");
        snapshot.value.push(3);
        assert_eq!(cache.get(&"a").map(|e| e.value), Some(vec![1, 2]));
    }
}
