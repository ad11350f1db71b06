//! # Cache Front End
//!
//! Every dao read goes through the cache first. A key is in one of three
//! states:
//!
//! | State | Stored value | Dao behaviour |
//! |-------|--------------|---------------|
//! | not cached | nothing | query the backend |
//! | cached absent | [`CacheEntry::Absent`] | "not found", no backend hit |
//! | cached present | any other entry | return it |
//!
//! The absent sentinel is what stops cache penetration: once a lookup has
//! confirmed that an id does not exist, repeated lookups stop reaching the
//! database until the key is written or deleted.
//!
//! ## Failure Handling
//!
//! [`CacheFront`] wraps a [`CacheBackend`]. Read failures are logged and
//! degrade to a miss; write failures are returned to the caller.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{Error, Result};
use crate::types::{IndexedData, ObjectData};

// =============================================================================
// Entries and Backends
// =============================================================================

/// A cached value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    /// The key was looked up and does not exist.
    Absent,
    /// A stored record.
    Object(ObjectData),
    /// The rows of one index lookup.
    Index(Vec<IndexedData>),
    /// The result of one count query.
    Count(i64),
}

impl CacheEntry {
    /// Returns true for the absent sentinel.
    pub fn is_absent(&self) -> bool {
        matches!(self, CacheEntry::Absent)
    }
}

/// A key-value store the dao caches into.
///
/// Implementations must be safe to share across threads. Bulk operations
/// default to per-key loops; backends with a native bulk call should
/// override them.
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// Returns the entry for `key`, or `None` if not cached.
    fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Stores `entry` under `key`.
    fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Removes `key`.
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns the cached entries among `keys`. Uncached keys are left out.
    fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key)? {
                out.insert(key.clone(), entry);
            }
        }
        Ok(out)
    }

    /// Stores every `(key, entry)` pair.
    fn set_bulk(&self, entries: Vec<(String, CacheEntry)>) -> Result<()> {
        for (key, entry) in entries {
            self.set(&key, entry)?;
        }
        Ok(())
    }
}

/// A cache that stores nothing. Every read is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl CacheBackend for NoopCache {
    fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _entry: CacheEntry) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn get_bulk(&self, _keys: &[String]) -> Result<HashMap<String, CacheEntry>> {
        Ok(HashMap::new())
    }

    fn set_bulk(&self, _entries: Vec<(String, CacheEntry)>) -> Result<()> {
        Ok(())
    }
}

/// Bounded in-process cache with least-recently-used eviction.
pub struct LruCacheBackend {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LruCacheBackend {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::Config("cache capacity must be positive".into()))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("lru cache lock poisoned".into()))
    }
}

impl fmt::Debug for LruCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCacheBackend")
            .field("len", &self.len())
            .finish()
    }
}

impl CacheBackend for LruCacheBackend {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.lock()?.put(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.pop(key);
        Ok(())
    }

    fn get_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>> {
        let mut cache = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|k| cache.get(k).map(|e| (k.clone(), e.clone())))
            .collect())
    }

    fn set_bulk(&self, entries: Vec<(String, CacheEntry)>) -> Result<()> {
        let mut cache = self.lock()?;
        for (key, entry) in entries {
            cache.put(key, entry);
        }
        Ok(())
    }
}

// =============================================================================
// Cache Front
// =============================================================================

/// A namespaced view of a cache backend, as used by one dao.
///
/// Keys are prefixed with the entity name so several daos can share one
/// backend.
#[derive(Debug, Clone)]
pub struct CacheFront {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
}

impl CacheFront {
    /// Creates a front for `namespace` over `backend`.
    pub fn new(backend: Arc<dyn CacheBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Reads one key. A backend failure is logged and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.backend.get(&self.key(key)) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, key, error = %e, "cache read failed, falling back to database");
                None
            }
        }
    }

    /// Reads many keys, keyed by the un-namespaced key. Failures degrade to
    /// an all-miss result.
    pub fn get_bulk(&self, keys: &[String]) -> HashMap<String, CacheEntry> {
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        match self.backend.get_bulk(&full) {
            Ok(mut found) => keys
                .iter()
                .zip(full.iter())
                .filter_map(|(k, f)| found.remove(f).map(|e| (k.clone(), e)))
                .collect(),
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, keys = keys.len(), error = %e, "bulk cache read failed, falling back to database");
                HashMap::new()
            }
        }
    }

    /// Writes one key.
    pub fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.backend.set(&self.key(key), entry)
    }

    /// Writes many keys.
    pub fn set_bulk(&self, entries: Vec<(String, CacheEntry)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let entries = entries
            .into_iter()
            .map(|(k, e)| (self.key(&k), e))
            .collect();
        self.backend.set_bulk(entries)
    }

    /// Removes one key.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.key(key))
    }
}

// =============================================================================
// Tests
// =============================================================================
