//! Explicit content-keyed cache.
//!
//! Values are keyed by a SHA-256 digest of whatever inputs produced them
//! (model file bytes, log generation, ...). Nothing is memoised implicitly:
//! the owner decides when to look up, insert and invalidate.
//!
//! Invalidation policy:
//! - `invalidate(key)` drops one entry, `clear()` drops everything;
//! - inserting into a full cache evicts the oldest inserted entry.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// SHA-256 digest identifying cached content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Digest several inputs. Each part is length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` produce different keys.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded map from [`ContentKey`] to cloned values.
pub struct KeyedCache<V> {
    entries: HashMap<ContentKey, V>,
    order: VecDeque<ContentKey>,
    capacity: usize,
    stats: CacheStats,
}

impl<V: Clone> KeyedCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: &ContentKey) -> Option<V> {
        match self.entries.get(key) {
            Some(value) => {
                self.stats.hits += 1;
                Some(value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: ContentKey, value: V) {
        if self.entries.insert(key, value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
            }
        }
    }

    /// Return the cached value or build, insert and return it.
    /// A failing builder leaves the cache unchanged.
    pub fn get_or_try_insert_with<F>(&mut self, key: ContentKey, build: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = build()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&mut self, key: &ContentKey) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
