//! Per-key exclusive locks with refcount-driven garbage collection.
//!
//! Grounded on the same `DashMap<K, Arc<tokio::sync::Mutex<()>>>` +
//! weak-pointer bookkeeping idiom `repogate_singleflight::Coalesce` uses
//! for its pending/fetched state, generalized here to plain mutual
//! exclusion rather than coalesced-result delivery: `FetchCoordinator`
//! needs to hold a lock across several `await` points (mkdir, stream,
//! rename), which a single-flight future can't express.

use crate::types::CacheKey;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A registry of per-[`CacheKey`] exclusive locks.
#[derive(Default)]
pub struct FileLockRegistry {
    entries: DashMap<CacheKey, Weak<Mutex<()>>>,
}

/// Releases the held lock (and, if no other caller is waiting, removes
/// the registry entry) when dropped.
pub struct Release {
    _guard: OwnedMutexGuard<()>,
}

impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires exclusive ownership of `key`, blocking until any current
    /// holder releases it.
    pub async fn acquire(&self, key: &CacheKey) -> Release {
        let mutex = loop {
            if let Some(entry) = self.entries.get(key) {
                if let Some(mutex) = entry.upgrade() {
                    break mutex;
                }
            }
            // No live entry: install a fresh one. A concurrent caller may
            // race us here; `DashMap::entry` makes the insert atomic so at
            // most one fresh mutex wins.
            let mutex = Arc::new(Mutex::new(()));
            let mut inserted = None;
            self.entries
                .entry(key.clone())
                .and_modify(|existing| {
                    if existing.upgrade().is_none() {
                        *existing = Arc::downgrade(&mutex);
                        inserted = Some(mutex.clone());
                    }
                })
                .or_insert_with(|| {
                    inserted = Some(mutex.clone());
                    Arc::downgrade(&mutex)
                });
            if let Some(mutex) = inserted {
                break mutex;
            }
            // Lost the race and the winner's mutex is already gone; retry.
        };

        let guard = mutex.lock_owned().await;
        Release { _guard: guard }
    }

    /// Removes entries whose mutex has no outstanding holder or waiter.
    /// Call periodically (the Janitor does this) to bound registry growth;
    /// `acquire` also self-heals by skipping dead entries.
    pub fn gc(&self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live entries (held or waited-on locks), not a total of
    /// all keys ever seen.
    pub fn size(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn excludes_concurrent_holders() {
        let registry = StdArc::new(FileLockRegistry::new());
        let key = CacheKey::new_unchecked("x.apk");
        let counter = StdArc::new(AtomicUsize::new(0));
        let max_observed = StdArc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            let counter = counter.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                let _release = registry.acquire(&key).await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_collected_after_release() {
        let registry = FileLockRegistry::new();
        let key = CacheKey::new_unchecked("x.apk");
        {
            let _release = registry.acquire(&key).await;
            assert_eq!(registry.size(), 1);
        }
        registry.gc();
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let registry = FileLockRegistry::new();
        let a = CacheKey::new_unchecked("a.apk");
        let b = CacheKey::new_unchecked("b.apk");
        let _release_a = registry.acquire(&a).await;
        let release_b = tokio::time::timeout(Duration::from_millis(50), registry.acquire(&b)).await;
        assert!(release_b.is_ok());
    }
}
