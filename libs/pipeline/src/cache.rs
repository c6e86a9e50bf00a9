//! Process-local key/value cache with per-entry TTLs.
//!
//! The cache stores opaque values; callers type-assert on read. A value of
//! an unexpected type degrades to a miss and evicts the entry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

/// Values are shared, type-erased and immutable once stored.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Contract for the process-wide cache reachable through the
/// [`AppContext`](crate::context::AppContext).
///
/// Implementations must be thread safe. Coherence across processes is not
/// required.
#[cfg_attr(test, mockall::automock)]
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// Returns the value stored under `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> Option<CacheValue>;

    /// Stores `value` under `key` for at most `ttl`.
    fn set(&self, key: &str, value: CacheValue, ttl: Duration);

    /// Removes the entry stored under `key`, if any.
    fn delete(&self, key: &str);
}

/// Reads a typed value from the cache. A present entry of a different type
/// is deleted and reported as a miss.
pub fn get_as<T: Send + Sync + 'static>(cache: &dyn Cache, key: &str) -> Option<Arc<T>> {
    let value = cache.get(key)?;
    match value.downcast::<T>() {
        Ok(typed) => Some(typed),
        Err(_) => {
            warn!(key, "unexpected value type in cache, evicting entry");
            cache.delete(key);
            None
        }
    }
}

struct Entry {
    value: CacheValue,
    expires_at: Instant,
}

/// In-memory [`Cache`] implementation.
///
/// Expired entries are dropped lazily on read and purged wholesale once the
/// map grows past a high-water mark.
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache").finish_non_exhaustive()
    }
}

const PURGE_HIGH_WATER: usize = 1024;

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<CacheValue> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: CacheValue, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let mut entries = self.entries.write().expect("cache lock poisoned");
        if entries.len() >= PURGE_HIGH_WATER {
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.remove(key);
    }
}
