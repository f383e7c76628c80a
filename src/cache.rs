//! In-memory memoization for the leaf transformers.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_CAPACITY: usize = 1000;

/// SHA-256 digest of some content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub(crate) fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Drop everything once the cache is full.
    ClearOnOverflow,
    /// Drop the least recently used entry.
    Lru,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of entries; zero disables caching.
    pub capacity: usize,
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            eviction: EvictionPolicy::ClearOnOverflow,
        }
    }
}

/// Identity of one leaf transformation: what was transformed, with which map, under which
/// name and encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_len: u64,
    pub content: Fingerprint,
    pub placeholders: Fingerprint,
    pub name: String,
    pub encoding: &'static str,
}

impl CacheKey {
    pub fn new(
        name: &str,
        bytes: &[u8],
        placeholders: Fingerprint,
        encoding: &'static str,
    ) -> Self {
        Self {
            content_len: bytes.len() as u64,
            content: Fingerprint::of(bytes),
            placeholders,
            name: name.to_string(),
            encoding,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

enum Store<K, V> {
    Disabled,
    ClearOnOverflow(HashMap<K, V>),
    Lru(LruCache<K, V>),
}

/// Size-bounded concurrent map with a configurable eviction policy.
pub struct BoundedCache<K, V> {
    store: Mutex<Store<K, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        let store = match (NonZeroUsize::new(config.capacity), config.eviction) {
            (None, _) => Store::Disabled,
            (Some(_), EvictionPolicy::ClearOnOverflow) => Store::ClearOnOverflow(HashMap::new()),
            (Some(cap), EvictionPolicy::Lru) => Store::Lru(LruCache::new(cap)),
        };
        Self {
            store: Mutex::new(store),
            capacity: config.capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let found = match &mut *store {
            Store::Disabled => None,
            Store::ClearOnOverflow(map) => map.get(key).cloned(),
            Store::Lru(lru) => lru.get(key).cloned(),
        };
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: K, value: V) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *store {
            Store::Disabled => {}
            Store::ClearOnOverflow(map) => {
                if map.len() >= self.capacity && !map.contains_key(&key) {
                    self.evictions
                        .fetch_add(map.len() as u64, Ordering::Relaxed);
                    map.clear();
                }
                map.insert(key, value);
            }
            Store::Lru(lru) => {
                if lru.len() >= self.capacity && !lru.contains(&key) {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                lru.put(key, value);
            }
        }
    }

    /// Returns the cached value for `key`, computing and storing it on a miss. `compute` runs
    /// outside the lock, so concurrent misses on one key may compute twice.
    pub fn get_or_insert_with(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn len(&self) -> usize {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match &*store {
            Store::Disabled => 0,
            Store::ClearOnOverflow(map) => map.len(),
            Store::Lru(lru) => lru.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
        }
    }
}
