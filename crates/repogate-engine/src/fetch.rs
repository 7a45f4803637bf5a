//! Single-flight miss handling: acquires the per-key lock, re-checks
//! freshness, then streams the upstream response to three independent
//! sinks (client, disk tmp file, memory buffer) and records a digest.
//!
//! Follows a "validate, else run the caller's fetch closure, then
//! promote" shape, generalized into a three-way streaming tee: none of
//! these sinks share a common upstream closure, so each sink's failure
//! state stays decoupled from the others.

use crate::access_tracker::AccessTimeTracker;
use crate::classify::Classification;
use crate::conditional::ClientValidatorMemo;
use crate::disk_cache::{DiskCache, DiskQuota};
use crate::integrity::IntegrityStore;
use crate::lock_registry::FileLockRegistry;
use crate::memory_cache::{MemoryCache, MemoryEntry};
use crate::metrics::Metrics;
use crate::types::CacheKey;
use crate::upstream::{FetchResult, UpstreamError, UpstreamPool};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use url::Url;

const CHUNK_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// What `FetchCoordinator::miss` found once it held the per-key lock.
pub enum MissOutcome {
    /// A concurrent fetch already populated the cache while we waited for
    /// the lock; caller should serve the cache entry instead of
    /// refetching.
    AlreadyCached,
    /// Upstream confirmed the client's `If-Modified-Since` is still
    /// current (spec §4.9 case 2): the cache entry is still valid even
    /// though it looked stale to `FreshnessPolicy`. Caller should serve
    /// the cache entry if still present, else a bare `304`.
    UpstreamNotModified,
    /// No valid entry; the upstream response is being streamed now.
    Fetched(FetchOutcome),
}

/// A response body in flight, being teed to disk and memory as it's
/// consumed by the caller.
pub struct FetchOutcome {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub upstream_index: usize,
    pub body: ReceiverStream<Result<Bytes, std::io::Error>>,
}

pub struct FetchCoordinator {
    locks: Arc<FileLockRegistry>,
    upstreams: Arc<UpstreamPool>,
    disk: Arc<DiskCache>,
    quota: Arc<DiskQuota>,
    memory: Arc<MemoryCache>,
    integrity: Arc<IntegrityStore>,
    access_tracker: Arc<AccessTimeTracker>,
    memo: Arc<ClientValidatorMemo>,
    metrics: Arc<dyn Metrics>,
    memory_cache_enabled: bool,
}

impl FetchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<FileLockRegistry>,
        upstreams: Arc<UpstreamPool>,
        disk: Arc<DiskCache>,
        quota: Arc<DiskQuota>,
        memory: Arc<MemoryCache>,
        integrity: Arc<IntegrityStore>,
        access_tracker: Arc<AccessTimeTracker>,
        memo: Arc<ClientValidatorMemo>,
        metrics: Arc<dyn Metrics>,
        memory_cache_enabled: bool,
    ) -> Self {
        Self {
            locks,
            upstreams,
            disk,
            quota,
            memory,
            integrity,
            access_tracker,
            memo,
            metrics,
            memory_cache_enabled,
        }
    }

    /// Handles a cache miss for `key`. Acquires the exclusive per-key
    /// lock, lets the caller re-check freshness under it (`recheck_fresh`
    /// runs synchronously right after the lock is held), and if still a
    /// miss, fetches from upstream and starts the streaming tee.
    ///
    /// `client_if_modified_since` is forwarded to upstream as its own
    /// conditional header; a `304` back from upstream is bridged per spec
    /// §4.9 case 2 rather than treated as a failed mirror.
    pub async fn miss<Fut>(
        &self,
        key: &CacheKey,
        upstream_path: &str,
        classification: &Classification,
        client_if_modified_since: Option<SystemTime>,
        client_for: impl Fn(Option<&Url>) -> ClientWithMiddleware,
        recheck_fresh: impl FnOnce() -> Fut,
    ) -> Result<MissOutcome, FetchError>
    where
        Fut: std::future::Future<Output = bool>,
    {
        let _release = self.locks.acquire(key).await;

        if recheck_fresh().await {
            return Ok(MissOutcome::AlreadyCached);
        }

        let (response, upstream_index) = match self
            .upstreams
            .fetch(upstream_path, client_if_modified_since, &client_for)
            .await?
        {
            FetchResult::NotModified => {
                if let Some(if_modified_since) = client_if_modified_since {
                    self.memo.record(key, if_modified_since);
                }
                return Ok(MissOutcome::UpstreamNotModified);
            }
            FetchResult::Modified(response, upstream_index) => (response, upstream_index),
        };

        let status = response.status();
        let headers = response.headers().clone();

        let key = key.clone();
        let classification = classification.clone();
        let disk = self.disk.clone();
        let quota = self.quota.clone();
        let memory = self.memory.clone();
        let integrity = self.integrity.clone();
        let access_tracker = self.access_tracker.clone();
        let metrics = self.metrics.clone();
        let memory_cache_enabled = self.memory_cache_enabled;

        let (client_tx, client_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            run_tee(
                response,
                key,
                classification,
                disk,
                quota,
                memory,
                integrity,
                access_tracker,
                metrics,
                memory_cache_enabled,
                client_tx,
            )
            .await;
            // _release is dropped here, at the end of the spawned task,
            // so the lock is held for the full duration of the tee and
            // not just until headers are ready.
            drop(_release);
        });

        Ok(MissOutcome::Fetched(FetchOutcome {
            status,
            headers,
            upstream_index,
            body: ReceiverStream::new(client_rx),
        }))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tee(
    response: reqwest::Response,
    key: CacheKey,
    classification: Classification,
    disk: Arc<DiskCache>,
    quota: Arc<DiskQuota>,
    memory: Arc<MemoryCache>,
    integrity: Arc<IntegrityStore>,
    access_tracker: Arc<AccessTimeTracker>,
    metrics: Arc<dyn Metrics>,
    memory_cache_enabled: bool,
    client_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let status = response.status();
    let headers_for_memory: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut tmp = match disk.create_tmp(&key).await {
        Ok(tmp) => Some(tmp),
        Err(err) => {
            warn!(key = %key, error = %err, "failed to create tmp file for fetch");
            None
        }
    };
    let mut tmp_failed = tmp.is_none();
    let mut client_failed = false;
    let mut memory_buffer: Option<BytesMut> = if memory_cache_enabled {
        Some(BytesMut::new())
    } else {
        None
    };
    let max_per_item_bytes = memory.max_per_item_bytes();

    let mut hasher = Sha256::new();
    let mut total_bytes: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(key = %key, error = %err, "upstream stream read failed");
                client_failed = true;
                let _ = client_tx
                    .send(Err(std::io::Error::new(std::io::ErrorKind::Other, err)))
                    .await;
                break;
            }
        };

        total_bytes += chunk.len() as u64;
        metrics.downloaded_bytes(chunk.len() as u64);
        hasher.update(&chunk);

        if !tmp_failed {
            if let Some(tmp_write) = tmp.as_mut() {
                if let Err(err) = DiskCache::tmp_file_mut(tmp_write).write_all(&chunk).await {
                    warn!(key = %key, error = %err, "cache write failed, continuing to serve client");
                    tmp_failed = true;
                }
            }
        }

        if !client_failed && client_tx.send(Ok(chunk.clone())).await.is_err() {
            client_failed = true;
        }

        if let Some(buffer) = memory_buffer.as_mut() {
            if buffer.len() as u64 + chunk.len() as u64 > max_per_item_bytes {
                memory_buffer = None;
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }
    }

    if !tmp_failed {
        if let Some(tmp_write) = tmp.take() {
            match disk.finalize_tmp(&key, tmp_write).await {
                Ok((tmp_path, size)) => {
                    let is_index = classification.is_index;
                    let admit = quota.check_and_admit(
                        size,
                        |candidate| candidate.as_str() == key.as_str() && is_index,
                        |candidate| access_tracker.get(candidate).map(nanos_to_system_time),
                    );
                    match admit {
                        Ok(()) => {
                            if let Err(err) = disk.promote(&key, tmp_path.clone()).await {
                                warn!(key = %key, error = %err, "promote failed after quota admission");
                                disk.discard_tmp(&tmp_path).await;
                                quota.remove(size);
                            } else {
                                let _ = access_tracker.record(&key);
                            }
                        }
                        Err(_) => {
                            metrics.quota_refused();
                            disk.discard_tmp(&tmp_path).await;
                        }
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "zero-length or unreadable tmp, not promoting");
                }
            }
        }
    } else if let Some(tmp_write) = tmp.take() {
        disk.discard_tmp(&tmp_write.tmp_path).await;
    }

    if let Some(buffer) = memory_buffer {
        if buffer.len() as u64 == total_bytes && memory_cache_enabled {
            let now = Instant::now();
            memory.set(
                key.clone(),
                MemoryEntry {
                    bytes: buffer.freeze(),
                    headers: headers_for_memory,
                    status: status.as_u16(),
                    create_time: now,
                    mod_time: now,
                    access_time: now,
                    access_count: 0,
                },
            );
        }
    }

    if total_bytes > 0 {
        let hex_digest = format!("{:x}", hasher.finalize());
        if let Some((_, expected)) = &classification.hash_addressed {
            if !hex_digest.eq_ignore_ascii_case(expected) {
                metrics.integrity_mismatch();
                warn!(key = %key, "hash-addressed body mismatched URL digest, discarding");
                integrity.remove(&key);
                let _ = tokio::fs::remove_file(disk.path_for(&key)).await;
            } else if !tmp_failed {
                integrity.record_digest(&key, hex_digest);
            }
        } else if !tmp_failed {
            integrity.record_digest(&key, hex_digest);
        }
    }

    info!(key = %key, bytes = total_bytes, status = %status, "fetch tee complete");
}

fn nanos_to_system_time(nanos: u128) -> SystemTime {
    std::time::UNIX_EPOCH + std::time::Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::classify::{classify, Kind};
    use crate::disk_cache::CleanStrategy;
    use tempfile::tempdir;

    fn classification_for(path: &str) -> Classification {
        classify("example.com", path).unwrap()
    }

    #[test]
    fn classification_kind_matches_expected_apk() {
        let classification = classification_for("/x/y.apk");
        assert_eq!(classification.kind, Kind::Apk);
    }

    #[tokio::test]
    async fn miss_returns_already_cached_when_recheck_finds_fresh_entry() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskCache::new(dir.path()));
        let quota = Arc::new(DiskQuota::new(dir.path(), 0, CleanStrategy::Lru));
        let memory = Arc::new(MemoryCache::new(crate::memory_cache::MemoryCacheConfig {
            max_bytes: 1_000_000,
            max_items: 100,
            ttl: std::time::Duration::from_secs(60),
            max_per_item_bytes: 100_000,
        }));
        let integrity = Arc::new(IntegrityStore::new(dir.path()));
        let access_tracker = Arc::new(AccessTimeTracker::in_memory());
        let memo = Arc::new(ClientValidatorMemo::new(std::time::Duration::from_secs(3600)));
        let locks = Arc::new(FileLockRegistry::new());
        let upstreams = Arc::new(UpstreamPool::new(vec![], vec![]));

        let coordinator = FetchCoordinator::new(
            locks,
            upstreams,
            disk,
            quota,
            memory,
            integrity,
            access_tracker,
            memo,
            Arc::new(crate::metrics::NoopMetrics),
            true,
        );

        let key = CacheKey::new_unchecked("x.apk");
        let classification = classification_for("/x.apk");

        let outcome = coordinator
            .miss(
                &key,
                "/x.apk",
                &classification,
                None,
                |_proxy| repogate_networking::build_fetch_client(None, std::time::Duration::from_secs(1)),
                || async { true },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, MissOutcome::AlreadyCached));
    }
}
