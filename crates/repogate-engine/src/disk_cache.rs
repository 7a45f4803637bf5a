//! Content storage on the filesystem: atomic tmp+rename writes, and a
//! quota that evicts non-index files by LRU/LFU(≈LRU)/FIFO when the cache
//! tree grows past its configured size.
//!
//! Generalizes a tmp-file + file-lock + atomic-promote write flow and a
//! priority/age/space eviction scan from a package-directory store into
//! a flat key-addressed store.

use crate::types::CacheKey;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskCacheError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to promote a zero-length write for {0}")]
    ZeroLengthWrite(CacheKey),
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota cleanup freed insufficient space for a write of {requested} bytes")]
    Refused { requested: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanStrategy {
    Lru,
    /// Degrades to LRU ordering in this implementation; a known
    /// limitation rather than a bug.
    Lfu,
    Fifo,
}

/// Tracks admitted bytes against a configured ceiling and runs eviction
/// scans when a write would exceed it. `max_bytes = 0` disables the
/// limit entirely.
pub struct DiskQuota {
    cache_root: PathBuf,
    max_bytes: u64,
    strategy: CleanStrategy,
    current_size: AtomicU64,
    cleanup_lock: Mutex<()>,
}

/// A candidate for eviction: everything the sort strategies need.
struct Candidate {
    key: CacheKey,
    path: PathBuf,
    size: u64,
    sort_time: std::time::SystemTime,
}

impl DiskQuota {
    pub fn new(cache_root: impl Into<PathBuf>, max_bytes: u64, strategy: CleanStrategy) -> Self {
        Self {
            cache_root: cache_root.into(),
            max_bytes,
            strategy,
            current_size: AtomicU64::new(0),
            cleanup_lock: Mutex::new(()),
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::SeqCst)
    }

    /// Walks the cache tree once and sets `current_size` to the sum of
    /// non-directory file sizes. Call once at startup.
    pub fn initialize(&self) -> std::io::Result<()> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.cache_root)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        self.current_size.store(total, Ordering::SeqCst);
        Ok(())
    }

    /// Admits `size` bytes, evicting non-index files if the write
    /// wouldn't otherwise fit. `is_index` closures let the quota skip
    /// index files during eviction scans, per spec (index files are
    /// never chosen for quota eviction).
    pub fn check_and_admit(
        &self,
        size: u64,
        is_index: impl Fn(&CacheKey) -> bool + Copy,
        access_time_of: impl Fn(&CacheKey) -> Option<std::time::SystemTime> + Copy,
    ) -> Result<(), QuotaError> {
        if self.max_bytes == 0 {
            self.current_size.fetch_add(size, Ordering::SeqCst);
            return Ok(());
        }

        if self.current_size.load(Ordering::SeqCst) + size <= self.max_bytes {
            self.current_size.fetch_add(size, Ordering::SeqCst);
            return Ok(());
        }

        self.cleanup(size, is_index, access_time_of);

        if self.current_size.load(Ordering::SeqCst) + size <= self.max_bytes {
            self.current_size.fetch_add(size, Ordering::SeqCst);
            Ok(())
        } else {
            Err(QuotaError::Refused { requested: size })
        }
    }

    fn cleanup(
        &self,
        needed: u64,
        is_index: impl Fn(&CacheKey) -> bool,
        access_time_of: impl Fn(&CacheKey) -> Option<std::time::SystemTime>,
    ) {
        let _guard = self.cleanup_lock.lock();

        let mut candidates: Vec<Candidate> = Vec::new();
        for entry in walkdir::WalkDir::new(&self.cache_root)
            .into_iter()
            .filter_map(Result::ok)
        {
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
            let Ok(relative) = entry.path().strip_prefix(&self.cache_root) else {
                continue;
            };
            let key = CacheKey::new_unchecked(relative.to_string_lossy().to_string());
            if is_index(&key) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let sort_time = match self.strategy {
                CleanStrategy::Lru | CleanStrategy::Lfu => access_time_of(&key)
                    .or_else(|| metadata.accessed().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                CleanStrategy::Fifo => metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            };
            candidates.push(Candidate {
                key,
                path: entry.path().to_path_buf(),
                size: metadata.len(),
                sort_time,
            });
        }

        candidates.sort_by_key(|c| c.sort_time);

        let mut freed = 0u64;
        for candidate in candidates {
            if freed >= needed {
                break;
            }
            if std::fs::remove_file(&candidate.path).is_ok() {
                freed += candidate.size;
                self.current_size.fetch_sub(candidate.size, Ordering::SeqCst);
            }
        }
    }

    /// Decrements accounting on an explicit deletion outside the normal
    /// write path (e.g. integrity repair, admin clear of one key).
    pub fn remove(&self, size: u64) {
        self.current_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(size))
            })
            .ok();
    }

    pub fn reset(&self) {
        self.current_size.store(0, Ordering::SeqCst);
    }
}

/// A handle used while streaming a fetch into the tmp+rename pipeline.
pub struct TmpWrite {
    pub tmp_path: PathBuf,
    file: tokio::fs::File,
}

/// Flat, key-addressed store rooted at `cache_root`.
pub struct DiskCache {
    cache_root: PathBuf,
}

impl DiskCache {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_root.join(key.as_str())
    }

    pub async fn exists(&self, key: &CacheKey) -> bool {
        tokio::fs::metadata(self.path_for(key)).await.is_ok()
    }

    pub async fn metadata(&self, key: &CacheKey) -> std::io::Result<std::fs::Metadata> {
        tokio::fs::metadata(self.path_for(key)).await
    }

    pub async fn open_read(&self, key: &CacheKey) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.path_for(key)).await
    }

    /// Creates `<dir>/tmp-<unique>` in the target directory for `key`,
    /// creating parent directories with mode `0755` as needed.
    pub async fn create_tmp(&self, key: &CacheKey) -> Result<TmpWrite, DiskCacheError> {
        let target = self.path_for(key);
        let dir = target.parent().unwrap_or(&self.cache_root).to_path_buf();
        create_dir_0755(&dir)
            .await
            .map_err(|source| DiskCacheError::Io {
                path: dir.clone(),
                source,
            })?;

        let unique = uuid_like_suffix();
        let tmp_path = dir.join(format!("tmp-{unique}"));
        let file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|source| DiskCacheError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        Ok(TmpWrite { tmp_path, file })
    }

    pub fn tmp_file_mut(tmp: &mut TmpWrite) -> &mut tokio::fs::File {
        &mut tmp.file
    }

    /// Closes and stats the tmp file. Returns `ZeroLengthWrite` without
    /// removing the tmp (the caller decides whether to remove it, since
    /// a zero-length body can also mean a write error already happened).
    pub async fn finalize_tmp(
        &self,
        key: &CacheKey,
        tmp: TmpWrite,
    ) -> Result<(PathBuf, u64), DiskCacheError> {
        use tokio::io::AsyncWriteExt;
        let TmpWrite { tmp_path, mut file } = tmp;
        file.flush().await.map_err(|source| DiskCacheError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        drop(file);
        let metadata = tokio::fs::metadata(&tmp_path)
            .await
            .map_err(|source| DiskCacheError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        if metadata.len() == 0 {
            return Err(DiskCacheError::ZeroLengthWrite(key.clone()));
        }
        Ok((tmp_path, metadata.len()))
    }

    /// Atomically renames `tmp_path` into place at `key`.
    pub async fn promote(&self, key: &CacheKey, tmp_path: PathBuf) -> Result<(), DiskCacheError> {
        let target = self.path_for(key);
        tokio::fs::rename(&tmp_path, &target)
            .await
            .map_err(|source| DiskCacheError::Io {
                path: target,
                source,
            })
    }

    pub async fn discard_tmp(&self, tmp_path: &Path) {
        let _ = tokio::fs::remove_file(tmp_path).await;
    }

    pub async fn remove(&self, key: &CacheKey) -> std::io::Result<()> {
        tokio::fs::remove_file(self.path_for(key)).await
    }

    /// Recursively clears the cache tree and recreates the root.
    pub async fn clear(&self) -> std::io::Result<()> {
        if tokio::fs::metadata(&self.cache_root).await.is_ok() {
            tokio::fs::remove_dir_all(&self.cache_root).await?;
        }
        create_dir_0755(&self.cache_root).await
    }
}

#[cfg(unix)]
async fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if tokio::fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)
    })
    .await
    .expect("blocking mkdir task panicked")
}

#[cfg(not(unix))]
async fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

fn uuid_like_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}-{:x}", std::process::id())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn zero_max_bytes_disables_quota() {
        let dir = tempdir().unwrap();
        let quota = DiskQuota::new(dir.path(), 0, CleanStrategy::Lru);
        quota
            .check_and_admit(10_000_000, |_| false, |_| None)
            .unwrap();
        assert_eq!(quota.current_size(), 10_000_000);
    }

    #[test]
    fn initialize_sums_existing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 50]).unwrap();
        let quota = DiskQuota::new(dir.path(), 1_000_000, CleanStrategy::Lru);
        quota.initialize().unwrap();
        assert_eq!(quota.current_size(), 150);
    }

    #[test]
    fn eviction_skips_index_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Release"), vec![0u8; 600 * 1024]).unwrap();
        std::fs::write(dir.path().join("b.apk"), vec![0u8; 300 * 1024]).unwrap();
        let quota = DiskQuota::new(dir.path(), 1024 * 1024, CleanStrategy::Fifo);
        quota.initialize().unwrap();

        let result = quota.check_and_admit(
            500 * 1024,
            |key| key.as_str() == "Release",
            |_| None,
        );

        assert!(result.is_ok());
        assert!(dir.path().join("Release").exists());
        assert!(!dir.path().join("b.apk").exists());
    }

    #[tokio::test]
    async fn tmp_and_rename_round_trips_content() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = CacheKey::new_unchecked("a/b/x.apk");

        let mut tmp = cache.create_tmp(&key).await.unwrap();
        DiskCache::tmp_file_mut(&mut tmp)
            .write_all(b"package-bytes")
            .await
            .unwrap();
        let (tmp_path, size) = cache.finalize_tmp(&key, tmp).await.unwrap();
        assert_eq!(size, 13);
        cache.promote(&key, tmp_path).await.unwrap();

        assert!(cache.exists(&key).await);
        let contents = tokio::fs::read(cache.path_for(&key)).await.unwrap();
        assert_eq!(contents, b"package-bytes");
    }

    #[tokio::test]
    async fn zero_length_write_is_rejected() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = CacheKey::new_unchecked("empty.apk");
        let tmp = cache.create_tmp(&key).await.unwrap();
        let err = cache.finalize_tmp(&key, tmp).await.unwrap_err();
        assert!(matches!(err, DiskCacheError::ZeroLengthWrite(_)));
    }
}
