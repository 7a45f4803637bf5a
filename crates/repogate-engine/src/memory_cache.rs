//! Bounded in-process LRU of small response bodies.
//!
//! Generalizes a dashmap-keyed entry pattern (elsewhere used to track
//! on-disk revisions, not ordering) into a true LRU by adding an
//! explicit access-order index. The access order is a plain
//! `indexmap::IndexMap` re-ordered on every access rather than a
//! hand-rolled intrusive list, which keeps this dependency-light and
//! matches the rest of the workspace's preference for `indexmap` over a
//! dedicated `lru` crate.

use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::types::CacheKey;

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub bytes: Bytes,
    pub headers: Vec<(String, String)>,
    pub status: u16,
    pub create_time: Instant,
    pub mod_time: Instant,
    pub access_time: Instant,
    pub access_count: u64,
}

impl MemoryEntry {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryCacheConfig {
    pub max_bytes: u64,
    pub max_items: usize,
    pub ttl: Duration,
    pub max_per_item_bytes: u64,
}

struct Inner {
    entries: std::collections::HashMap<CacheKey, MemoryEntry>,
    /// Most-recently-accessed key is at the back.
    order: IndexSet<CacheKey>,
    total_bytes: u64,
}

pub struct MemoryCache {
    config: MemoryCacheConfig,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: std::collections::HashMap::new(),
                order: IndexSet::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Inserts `entry` under `key`, evicting least-recently-accessed
    /// entries until it fits. Refuses (returns `false`) if the item is
    /// larger than `max_per_item_bytes` or cannot be made to fit even
    /// after evicting everything else.
    pub fn set(&self, key: CacheKey, entry: MemoryEntry) -> bool {
        let size = entry.size() as u64;
        if size > self.config.max_per_item_bytes {
            return false;
        }
        if self.config.max_items == 0 {
            return false;
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = inner.entries.remove(&key) {
            inner.total_bytes -= existing.size() as u64;
            inner.order.shift_remove(&key);
        }

        while (inner.total_bytes + size > self.config.max_bytes
            || inner.entries.len() + 1 > self.config.max_items)
            && !inner.order.is_empty()
        {
            let Some(oldest) = inner.order.shift_remove_index(0) else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.total_bytes -= evicted.size() as u64;
            }
        }

        if inner.total_bytes + size > self.config.max_bytes
            || inner.entries.len() + 1 > self.config.max_items
        {
            return false;
        }

        inner.total_bytes += size;
        inner.order.insert(key.clone());
        inner.entries.insert(key, entry);
        true
    }

    /// Returns a clone of the entry for `key`, updating its access stats
    /// and LRU position. Expired entries are treated as misses and
    /// removed.
    pub fn get(&self, key: &CacheKey) -> Option<MemoryEntry> {
        let mut inner = self.inner.lock();
        let expired = inner
            .entries
            .get(key)
            .map(|entry| entry.access_time.elapsed() > self.config.ttl)
            .unwrap_or(false);

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.total_bytes -= entry.size() as u64;
            }
            inner.order.shift_remove(key);
            return None;
        }

        let result = inner.entries.get_mut(key).map(|entry| {
            entry.access_time = Instant::now();
            entry.access_count += 1;
            entry.clone()
        });
        if result.is_some() {
            inner.order.shift_remove(key);
            inner.order.insert(key.clone());
        }
        result
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_bytes -= entry.size() as u64;
        }
        inner.order.shift_remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.total_bytes = 0;
    }

    /// Removes all entries whose age (since last access) exceeds `ttl`.
    /// Intended to be called roughly once a minute by the janitor.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let ttl = self.config.ttl;
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.access_time.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.total_bytes -= entry.size() as u64;
            }
            inner.order.shift_remove(key);
        }
        expired.len()
    }

    pub fn max_per_item_bytes(&self) -> u64 {
        self.config.max_per_item_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(bytes: &[u8]) -> MemoryEntry {
        let now = Instant::now();
        MemoryEntry {
            bytes: Bytes::copy_from_slice(bytes),
            headers: Vec::new(),
            status: 200,
            create_time: now,
            mod_time: now,
            access_time: now,
            access_count: 0,
        }
    }

    #[test]
    fn refuses_items_larger_than_per_item_limit() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_bytes: 1024,
            max_items: 10,
            ttl: Duration::from_secs(60),
            max_per_item_bytes: 4,
        });
        assert!(!cache.set(CacheKey::new_unchecked("x"), entry(b"too-big")));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn evicts_lru_to_make_room() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_bytes: 10,
            max_items: 10,
            ttl: Duration::from_secs(60),
            max_per_item_bytes: 10,
        });
        assert!(cache.set(CacheKey::new_unchecked("a"), entry(b"aaaaa")));
        assert!(cache.set(CacheKey::new_unchecked("b"), entry(b"bbbbb")));
        // touch "a" so "b" becomes the LRU victim
        cache.get(&CacheKey::new_unchecked("a"));
        assert!(cache.set(CacheKey::new_unchecked("c"), entry(b"ccccc")));

        assert!(cache.get(&CacheKey::new_unchecked("a")).is_some());
        assert!(cache.get(&CacheKey::new_unchecked("b")).is_none());
        assert!(cache.get(&CacheKey::new_unchecked("c")).is_some());
        assert!(cache.total_bytes() <= 10);
    }

    #[test]
    fn get_updates_access_count() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_bytes: 1024,
            max_items: 10,
            ttl: Duration::from_secs(60),
            max_per_item_bytes: 1024,
        });
        cache.set(CacheKey::new_unchecked("a"), entry(b"hi"));
        let first = cache.get(&CacheKey::new_unchecked("a")).unwrap();
        let second = cache.get(&CacheKey::new_unchecked("a")).unwrap();
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 2);
    }

    #[test]
    fn respects_max_items_even_under_byte_budget() {
        let cache = MemoryCache::new(MemoryCacheConfig {
            max_bytes: 1_000_000,
            max_items: 1,
            ttl: Duration::from_secs(60),
            max_per_item_bytes: 1_000_000,
        });
        cache.set(CacheKey::new_unchecked("a"), entry(b"a"));
        cache.set(CacheKey::new_unchecked("b"), entry(b"b"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&CacheKey::new_unchecked("b")).is_some());
    }
}
