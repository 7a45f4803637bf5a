//! Background sweeps: expiry, upstream health, integrity, memo cleanup,
//! orphan digests — each on its own cadence, run independently of
//! request handling.
//!
//! Follows a scan-sort-evict loop (walk, consult policy, delete, `info!`
//! summary) applied to the flat cache tree; the health, memo and orphan
//! sweeps are new subject matter but reuse that same shape and logging
//! convention.

use crate::access_tracker::AccessTimeTracker;
use crate::classify::classify;
use crate::conditional::ClientValidatorMemo;
use crate::disk_cache::DiskQuota;
use crate::freshness::{FileMeta, Freshness, FreshnessPolicy};
use crate::integrity::IntegrityStore;
use crate::lock_registry::FileLockRegistry;
use crate::types::CacheKey;
use crate::upstream::UpstreamPool;
use anyhow::Context;
use reqwest_middleware::ClientWithMiddleware;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Janitor {
    cache_root: PathBuf,
    freshness: Arc<FreshnessPolicy>,
    access_tracker: Arc<AccessTimeTracker>,
    integrity: Arc<IntegrityStore>,
    quota: Arc<DiskQuota>,
    upstreams: Arc<UpstreamPool>,
    memo: Arc<ClientValidatorMemo>,
    locks: Arc<FileLockRegistry>,
    health_check_client: ClientWithMiddleware,
}

impl Janitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache_root: impl Into<PathBuf>,
        freshness: Arc<FreshnessPolicy>,
        access_tracker: Arc<AccessTimeTracker>,
        integrity: Arc<IntegrityStore>,
        quota: Arc<DiskQuota>,
        upstreams: Arc<UpstreamPool>,
        memo: Arc<ClientValidatorMemo>,
        locks: Arc<FileLockRegistry>,
        health_check_client: ClientWithMiddleware,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            freshness,
            access_tracker,
            integrity,
            quota,
            upstreams,
            memo,
            locks,
            health_check_client,
        }
    }

    /// Walks the cache tree, deletes anything `FreshnessPolicy` now
    /// considers stale, and removes its tracker entry, digest record and
    /// quota accounting. Runs on `cleanup_interval`.
    pub async fn expiry_sweep(&self) -> anyhow::Result<()> {
        let cache_root = self.cache_root.clone();
        let freshness = self.freshness.clone();
        let access_tracker = self.access_tracker.clone();
        let integrity = self.integrity.clone();
        let quota = self.quota.clone();

        let (scanned, removed, freed) = tokio::task::spawn_blocking(move || {
            scan_and_expire(&cache_root, &freshness, &access_tracker, &integrity, &quota)
        })
        .await
        .context("expiry sweep task panicked")??;

        info!(scanned, removed, freed_bytes = freed, "expiry sweep complete");
        Ok(())
    }

    /// Probes every upstream's health. Runs on `health_check.interval`.
    pub async fn health_loop(&self) {
        let snapshot = self.upstreams.snapshot();
        for server in snapshot.iter() {
            let healthy = self.upstreams.health(server, &self.health_check_client).await;
            info!(upstream = %server.name, healthy, "health check");
        }
    }

    /// Verifies every recorded digest, optionally repairing corruption.
    /// Runs on `data_integrity.check_interval`.
    pub async fn integrity_sweep(&self, auto_repair: bool) -> anyhow::Result<()> {
        let integrity = self.integrity.clone();
        let (checked, corrupt) =
            tokio::task::spawn_blocking(move || integrity.sweep(auto_repair))
                .await
                .context("integrity sweep task panicked")?
                .context("integrity sweep failed")?;
        info!(checked, corrupt, auto_repair, "integrity sweep complete");
        Ok(())
    }

    /// Drops `ClientValidatorMemo` entries older than `index_ttl`. Runs
    /// alongside the expiry sweep.
    pub fn memo_cleanup(&self) {
        let removed = self.memo.cleanup_expired();
        info!(removed, "memo cleanup complete");
    }

    /// Removes digest records whose backing file no longer exists.
    pub async fn orphan_hash_cleanup(&self) -> anyhow::Result<()> {
        let integrity = self.integrity.clone();
        let removed = tokio::task::spawn_blocking(move || integrity.orphan_sweep())
            .await
            .context("orphan sweep task panicked")?;
        info!(removed, "orphan hash cleanup complete");
        Ok(())
    }

    /// Drops per-key locks with no outstanding holder or waiter. Runs
    /// alongside the expiry sweep to bound `FileLockRegistry` growth.
    pub fn lock_gc(&self) {
        self.locks.gc();
        info!(remaining = self.locks.size(), "lock registry gc complete");
    }

    /// Runs every configured sweep once, in the order a single janitor
    /// tick would use. The caller schedules this on its own cadences
    /// (`tokio::time::interval` per sweep) — this helper exists for
    /// tests and for a simple "run everything now" admin action.
    pub async fn run_all(&self, auto_repair: bool) -> anyhow::Result<()> {
        self.expiry_sweep().await?;
        self.health_loop().await;
        self.integrity_sweep(auto_repair).await?;
        self.memo_cleanup();
        self.orphan_hash_cleanup().await?;
        self.lock_gc();
        Ok(())
    }
}

fn scan_and_expire(
    cache_root: &Path,
    freshness: &FreshnessPolicy,
    access_tracker: &AccessTimeTracker,
    integrity: &IntegrityStore,
    quota: &DiskQuota,
) -> anyhow::Result<(usize, usize, u64)> {
    let mut scanned = 0usize;
    let mut removed = 0usize;
    let mut freed = 0u64;

    for entry in walkdir::WalkDir::new(cache_root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with("tmp-"))
            .unwrap_or(false)
        {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(cache_root) else {
            continue;
        };
        let relative_str = relative.to_string_lossy().to_string();
        scanned += 1;

        // Re-derive classification from the stored relative path itself
        // rather than the original request, since the janitor has no
        // request context; host is irrelevant here (already baked into
        // the apt/<host>/... key), so an empty host is fine for the
        // is_index/hash_addressed flags this walk only needs.
        let Ok(classification) = classify("", &format!("/{relative_str}")) else {
            continue;
        };
        let key = CacheKey::new_unchecked(relative_str);

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mtime = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let atime = metadata.accessed().ok();

        let verdict = freshness.evaluate(
            classification.is_index,
            classification.hash_addressed.is_some(),
            FileMeta { mtime, atime },
            access_tracker,
            &key,
        );

        if verdict == Freshness::Stale {
            let size = metadata.len();
            if std::fs::remove_file(entry.path()).is_ok() {
                let _ = access_tracker.remove(&key);
                integrity.remove(&key);
                quota.remove(size);
                removed += 1;
                freed += size;
            }
        }
    }

    Ok((scanned, removed, freed))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk_cache::CleanStrategy;
    use crate::freshness::FreshnessConfig;
    use crate::upstream::UpstreamPool;
    use tempfile::tempdir;

    fn janitor_over(dir: &Path) -> Janitor {
        let freshness = Arc::new(FreshnessPolicy::new(FreshnessConfig {
            index_ttl: Duration::from_millis(1),
            pkg_ttl: Duration::from_millis(1),
        }));
        let access_tracker = Arc::new(AccessTimeTracker::in_memory());
        let integrity = Arc::new(IntegrityStore::new(dir));
        let quota = Arc::new(DiskQuota::new(dir, 0, CleanStrategy::Lru));
        let upstreams = Arc::new(UpstreamPool::new(vec![], vec![]));
        let memo = Arc::new(ClientValidatorMemo::new(Duration::from_secs(1)));
        let locks = Arc::new(FileLockRegistry::new());
        let client = repogate_networking::build_health_check_client(None, Duration::from_secs(1));

        Janitor::new(
            dir,
            freshness,
            access_tracker,
            integrity,
            quota,
            upstreams,
            memo,
            locks,
            client,
        )
    }

    #[tokio::test]
    async fn expiry_sweep_deletes_stale_non_index_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.apk"), b"stale-bytes").unwrap();
        let janitor = janitor_over(dir.path());

        tokio::time::sleep(Duration::from_millis(20)).await;
        janitor.expiry_sweep().await.unwrap();

        assert!(!dir.path().join("x.apk").exists());
    }

    #[tokio::test]
    async fn memo_cleanup_drops_expired_entries() {
        let dir = tempdir().unwrap();
        let janitor = janitor_over(dir.path());
        let key = CacheKey::new_unchecked("Release");
        janitor.memo.record(&key, std::time::SystemTime::now());
        tokio::time::sleep(Duration::from_millis(5)).await;

        janitor.memo_cleanup();
        assert_eq!(janitor.memo.len(), 0);
    }

    #[tokio::test]
    async fn lock_gc_drops_released_locks() {
        let dir = tempdir().unwrap();
        let janitor = janitor_over(dir.path());
        let key = CacheKey::new_unchecked("x.apk");
        {
            let _release = janitor.locks.acquire(&key).await;
            assert_eq!(janitor.locks.size(), 1);
        }
        janitor.lock_gc();
        assert_eq!(janitor.locks.size(), 0);
    }

    #[tokio::test]
    async fn orphan_hash_cleanup_removes_dead_records() {
        let dir = tempdir().unwrap();
        let janitor = janitor_over(dir.path());
        let key = CacheKey::new_unchecked("ghost.apk");
        janitor.integrity.record_digest(&key, "deadbeef".to_string());

        janitor.orphan_hash_cleanup().await.unwrap();
        assert!(janitor.integrity.resolve_by_hash("deadbeef").is_none());
    }
}
