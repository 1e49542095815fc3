//! Bounded, TTL-evicting read-through cache.
//!
//! Shared by the profile and ability loaders and usable for provider
//! response caching. Entries are bounded three ways: a maximum entry
//! count, a maximum total byte size, and a per-entry time-to-live. Reads
//! never block on I/O; writes briefly hold the cache lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for a [`TtlCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries. Oldest entries are evicted first.
    pub max_entries: usize,
    /// Maximum total payload bytes across all entries.
    pub max_bytes: usize,
    /// Time after which an entry is considered stale and dropped on access.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 8 * 1024 * 1024,
            ttl: Duration::from_secs(300),
        }
    }
}

struct CacheEntry<V> {
    value: V,
    bytes: usize,
    inserted_at: Instant,
}

/// A thread-safe cache with TTL, entry-count, and byte-size bounds.
///
/// Values are cloned out on read, so `V` is typically an `Arc` or a small
/// owned value.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use automatosx::cache::{CacheConfig, TtlCache};
///
/// let cache: TtlCache<String, String> = TtlCache::new(CacheConfig {
///     max_entries: 2,
///     max_bytes: 1024,
///     ttl: Duration::from_secs(60),
/// });
///
/// cache.insert("a".into(), "alpha".into(), 5);
/// assert_eq!(cache.get(&"a".to_string()).as_deref(), Some("alpha"));
/// assert_eq!(cache.len(), 1);
/// ```
pub struct TtlCache<K, V> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    total_bytes: Mutex<usize>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with the given bounds.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            total_bytes: Mutex::new(0),
        }
    }

    /// Fetch a value, dropping it first when its TTL has elapsed.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.config.ttl,
            None => return None,
        };
        if expired {
            if let Some(entry) = entries.remove(key) {
                *self.total_bytes.lock().unwrap() -= entry.bytes;
            }
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    /// Insert a value with an explicit payload size in bytes.
    ///
    /// Replacing an existing key releases its old byte budget. When either
    /// bound would be exceeded, expired entries are purged first, then the
    /// oldest live entries are evicted until the new value fits.
    pub fn insert(&self, key: K, value: V, bytes: usize) {
        let mut entries = self.entries.lock().unwrap();
        let mut total = self.total_bytes.lock().unwrap();

        if let Some(old) = entries.remove(&key) {
            *total -= old.bytes;
        }

        // Purge expired entries before evicting live ones.
        let ttl = self.config.ttl;
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            if let Some(e) = entries.remove(&k) {
                *total -= e.bytes;
            }
        }

        while entries.len() >= self.config.max_entries
            || (*total + bytes > self.config.max_bytes && !entries.is_empty())
        {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    if let Some(e) = entries.remove(&k) {
                        *total -= e.bytes;
                    }
                }
                None => break,
            }
        }

        if bytes <= self.config.max_bytes {
            *total += bytes;
            entries.insert(
                key,
                CacheEntry {
                    value,
                    bytes,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Remove a single entry.
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.remove(key) {
            *self.total_bytes.lock().unwrap() -= e.bytes;
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
        *self.total_bytes.lock().unwrap() = 0;
    }

    /// Number of live entries (expired entries may still be counted until
    /// they are touched).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes currently accounted for.
    pub fn total_bytes(&self) -> usize {
        *self.total_bytes.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_entries: usize, max_bytes: usize) -> TtlCache<String, String> {
        TtlCache::new(CacheConfig {
            max_entries,
            max_bytes,
            ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn evicts_oldest_when_entry_bound_hit() {
        let cache = small_cache(2, 1024);
        cache.insert("a".into(), "1".into(), 1);
        cache.insert("b".into(), "2".into(), 1);
        cache.insert("c".into(), "3".into(), 1);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a".to_string()).is_none());
        assert_eq!(cache.get(&"c".to_string()).as_deref(), Some("3"));
    }

    #[test]
    fn evicts_until_byte_bound_fits() {
        let cache = small_cache(16, 10);
        cache.insert("a".into(), "x".into(), 6);
        cache.insert("b".into(), "y".into(), 6);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 6);
        assert_eq!(cache.get(&"b".to_string()).as_deref(), Some("y"));
    }

    #[test]
    fn ttl_expiry_drops_on_access() {
        let cache: TtlCache<String, String> = TtlCache::new(CacheConfig {
            max_entries: 4,
            max_bytes: 1024,
            ttl: Duration::from_millis(0),
        });
        cache.insert("a".into(), "1".into(), 1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&"a".to_string()).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn replacing_a_key_releases_its_bytes() {
        let cache = small_cache(4, 10);
        cache.insert("a".into(), "1".into(), 8);
        cache.insert("a".into(), "2".into(), 4);
        assert_eq!(cache.total_bytes(), 4);
        assert_eq!(cache.get(&"a".to_string()).as_deref(), Some("2"));
    }
}
