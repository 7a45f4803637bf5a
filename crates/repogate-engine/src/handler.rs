//! Top-level request dispatch: classify, consult memory then disk under
//! freshness/integrity, bridge conditional requests, and fall through to
//! `FetchCoordinator` on a miss.
//!
//! `CONNECT` tunneling and transparent (non-APK/APT) forwarding are the
//! caller's concern (`repogate-server`'s own routing) — this module only
//! implements the caching path, the part that is actually the engine's.

use crate::classify::{classify, Classification, ClassifyError};
use crate::conditional::{evaluate_client_to_cache, ClientValidatorMemo, ConditionalOutcome};
use crate::fetch::{FetchCoordinator, FetchError, FetchOutcome, MissOutcome};
use crate::freshness::{FileMeta, Freshness, FreshnessPolicy};
use crate::integrity::{IntegrityStore, VerifyResult};
use crate::memory_cache::{MemoryCache, MemoryEntry};
use crate::types::CacheKey;
use crate::access_tracker::AccessTimeTracker;
use crate::disk_cache::DiskCache;
use crate::metrics::Metrics;
use reqwest_middleware::ClientWithMiddleware;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// What the caller (the HTTP layer) should do to answer the request.
pub enum HandlerOutcome {
    NotModified,
    MemoryHit(MemoryEntry),
    DiskHit {
        path: PathBuf,
        headers: Vec<(String, String)>,
    },
    Fetched(FetchOutcome),
}

pub struct RequestHandler {
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    freshness: Arc<FreshnessPolicy>,
    integrity: Arc<IntegrityStore>,
    access_tracker: Arc<AccessTimeTracker>,
    memo: Arc<ClientValidatorMemo>,
    fetch: Arc<FetchCoordinator>,
    metrics: Arc<dyn Metrics>,
}

impl RequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<MemoryCache>,
        disk: Arc<DiskCache>,
        freshness: Arc<FreshnessPolicy>,
        integrity: Arc<IntegrityStore>,
        access_tracker: Arc<AccessTimeTracker>,
        memo: Arc<ClientValidatorMemo>,
        fetch: Arc<FetchCoordinator>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            memory,
            disk,
            freshness,
            integrity,
            access_tracker,
            memo,
            fetch,
            metrics,
        }
    }

    /// Handles a cacheable `GET`/`HEAD` for `path` against `host` (used to
    /// build the APT cache key). `client_if_modified_since` is the
    /// parsed `If-Modified-Since` header, if any.
    pub async fn handle(
        &self,
        host: &str,
        path: &str,
        client_if_modified_since: Option<SystemTime>,
        client_for: impl Fn(Option<&Url>) -> ClientWithMiddleware,
    ) -> Result<HandlerOutcome, HandlerError> {
        let classification = classify(host, path)?;
        let key = classification.key.clone();

        if let Some(entry) = self.memory.get(&key) {
            let last_modified = header_last_modified(&entry.headers).unwrap_or(entry.mod_time_as_system_time());
            // Hash-addressed paths name an immutable, content-verified blob;
            // conditional headers never apply to them (spec §4.9 case 3).
            let outcome = if classification.hash_addressed.is_some() {
                ConditionalOutcome::Full
            } else {
                evaluate_client_to_cache(
                    client_if_modified_since,
                    last_modified,
                    classification.kind == crate::classify::Kind::Apt,
                    &key,
                    &self.memo,
                )
            };
            self.metrics.memory_hit();
            return Ok(match outcome {
                ConditionalOutcome::NotModified => HandlerOutcome::NotModified,
                ConditionalOutcome::Full => HandlerOutcome::MemoryHit(entry),
            });
        }

        if let Some(file_info) = self.serveable_from_disk(&classification).await {
            self.metrics.disk_hit();
            let outcome = if classification.hash_addressed.is_some() {
                ConditionalOutcome::Full
            } else {
                evaluate_client_to_cache(
                    client_if_modified_since,
                    file_info.mtime,
                    classification.kind == crate::classify::Kind::Apt,
                    &key,
                    &self.memo,
                )
            };
            return Ok(match outcome {
                ConditionalOutcome::NotModified => HandlerOutcome::NotModified,
                ConditionalOutcome::Full => HandlerOutcome::DiskHit {
                    path: self.disk.path_for(&key),
                    headers: Vec::new(),
                },
            });
        }

        self.metrics.miss();
        let classification_for_recheck = classification.clone();
        let disk = self.disk.clone();
        let freshness = self.freshness.clone();
        let integrity = self.integrity.clone();
        let access_tracker = self.access_tracker.clone();

        let outcome = self
            .fetch
            .miss(
                &key,
                path,
                &classification,
                client_if_modified_since,
                client_for,
                move || {
                    let disk = disk.clone();
                    let freshness = freshness.clone();
                    let integrity = integrity.clone();
                    let access_tracker = access_tracker.clone();
                    let classification = classification_for_recheck.clone();
                    async move {
                        serveable_from_disk_with(&disk, &freshness, &integrity, &access_tracker, &classification)
                            .await
                            .is_some()
                    }
                },
            )
            .await?;

        Ok(match outcome {
            MissOutcome::AlreadyCached => HandlerOutcome::DiskHit {
                path: self.disk.path_for(&key),
                headers: Vec::new(),
            },
            // Upstream confirmed the client's conditional header is still
            // current (spec §4.9 case 2); serve what's on disk if the
            // recheck found it, else a bare 304.
            MissOutcome::UpstreamNotModified => {
                if self.serveable_from_disk(&classification).await.is_some() {
                    HandlerOutcome::DiskHit {
                        path: self.disk.path_for(&key),
                        headers: Vec::new(),
                    }
                } else {
                    HandlerOutcome::NotModified
                }
            }
            MissOutcome::Fetched(outcome) => HandlerOutcome::Fetched(outcome),
        })
    }

    async fn serveable_from_disk(&self, classification: &Classification) -> Option<DiskFileInfo> {
        serveable_from_disk_with(
            &self.disk,
            &self.freshness,
            &self.integrity,
            &self.access_tracker,
            classification,
        )
        .await
    }
}

struct DiskFileInfo {
    mtime: SystemTime,
}

/// Checks whether `classification`'s cached file can be served as-is:
/// exists, passes freshness, and (for hash-addressed paths) passes
/// digest verification. Shared between the handler's pre-lock check and
/// the coordinator's in-lock recheck so both agree on what "still valid"
/// means.
async fn serveable_from_disk_with(
    disk: &DiskCache,
    freshness: &FreshnessPolicy,
    integrity: &IntegrityStore,
    access_tracker: &AccessTimeTracker,
    classification: &Classification,
) -> Option<DiskFileInfo> {
    let metadata = disk.metadata(&classification.key).await.ok()?;
    let mtime = metadata.modified().ok()?;
    let atime = metadata.accessed().ok();

    let is_hash_addressed = classification.hash_addressed.is_some();
    let verdict = freshness.evaluate(
        classification.is_index,
        is_hash_addressed,
        FileMeta { mtime, atime },
        access_tracker,
        &classification.key,
    );

    match verdict {
        Freshness::Stale => None,
        Freshness::Fresh => Some(DiskFileInfo { mtime }),
        Freshness::ContentAddressed => {
            let expected = classification
                .hash_addressed
                .as_ref()
                .map(|(_, digest)| digest.as_str());
            match integrity.verify(&classification.key, expected) {
                Ok(VerifyResult::Ok) => Some(DiskFileInfo { mtime }),
                _ => None,
            }
        }
    }
}

fn header_last_modified(headers: &[(String, String)]) -> Option<SystemTime> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("last-modified"))
        .and_then(|(_, value)| crate::conditional::parse_if_modified_since(value))
}

impl MemoryEntry {
    fn mod_time_as_system_time(&self) -> SystemTime {
        // `MemoryEntry::mod_time` is a monotonic `Instant`; absent a
        // `Last-Modified` header we fall back to "now minus elapsed",
        // which is only used as a conservative default (treats the
        // entry as just-modified, so conditional requests fall through
        // to a full response rather than a false 304).
        SystemTime::now()
            .checked_sub(self.mod_time.elapsed())
            .unwrap_or_else(SystemTime::now)
    }
}
