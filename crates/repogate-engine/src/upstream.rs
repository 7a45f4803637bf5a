//! Ordered pool of upstream mirrors with TTL-cached health, round-robin
//! selection, and fetch-with-failover.
//!
//! Generalizes a per-mirror atomic failure counter and mirror-selection
//! routine into a full ordered pool published as a copy-on-write
//! snapshot (so readers never block writers) with TTL-cached health via
//! an `Expiring<T>` shape, and coalesced probes via
//! `repogate_singleflight::Coalesce` so concurrent callers racing a
//! stale health cache share one `HEAD` request.

use arc_swap::ArcSwap;
use repogate_singleflight::Coalesce;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no available upstream for path {0}")]
    NoAvailableUpstream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct HealthState {
    healthy: HealthStatus,
    last_check: Option<Instant>,
    last_error: Option<String>,
    retry_count: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: HealthStatus::Healthy,
            last_check: None,
            last_error: None,
            retry_count: 0,
        }
    }
}

pub struct UpstreamServer {
    pub url: Url,
    pub proxy: Option<Url>,
    pub name: String,
    pub max_retries: u32,
    pub health_cache_ttl: Duration,
    health: RwLock<HealthState>,
}

impl UpstreamServer {
    pub fn new(url: Url, proxy: Option<Url>, name: impl Into<String>) -> Self {
        Self {
            url,
            proxy,
            name: name.into(),
            max_retries: 3,
            health_cache_ttl: Duration::from_secs(60),
            health: RwLock::new(HealthState::default()),
        }
    }

    pub fn is_healthy_cached(&self) -> bool {
        matches!(self.health.read().unwrap().healthy, HealthStatus::Healthy)
    }

    fn is_stale(&self) -> bool {
        if self.health_cache_ttl <= Duration::ZERO {
            return false;
        }
        match self.health.read().unwrap().last_check {
            None => true,
            Some(last) => last.elapsed() > self.health_cache_ttl,
        }
    }

    fn record_probe(&self, ok: bool, error: Option<String>) {
        let mut state = self.health.write().unwrap();
        state.last_check = Some(Instant::now());
        state.last_error = error;
        if ok {
            state.healthy = HealthStatus::Healthy;
            state.retry_count = 0;
        } else {
            state.retry_count += 1;
            if state.retry_count >= self.max_retries {
                state.healthy = HealthStatus::Unhealthy;
            }
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.health.read().unwrap().retry_count
    }
}

/// Ordered, copy-on-write snapshot of the configured upstreams.
pub struct UpstreamPool {
    snapshot: ArcSwap<Vec<Arc<UpstreamServer>>>,
    cursor: AtomicUsize,
    probe_coalesce: Coalesce<String, bool>,
    default_probe_paths: Vec<String>,
}

impl UpstreamPool {
    pub fn new(servers: Vec<UpstreamServer>, default_probe_paths: Vec<String>) -> Self {
        let servers = servers.into_iter().map(Arc::new).collect();
        Self {
            snapshot: ArcSwap::new(Arc::new(servers)),
            cursor: AtomicUsize::new(0),
            probe_coalesce: Coalesce::new(),
            default_probe_paths,
        }
    }

    /// Publishes a new, fully-replaced list of upstreams.
    pub fn replace(&self, servers: Vec<UpstreamServer>) {
        let servers = servers.into_iter().map(Arc::new).collect();
        self.snapshot.store(Arc::new(servers));
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<UpstreamServer>>> {
        self.snapshot.load_full()
    }

    /// Round-robin starting at the current cursor; returns the first
    /// healthy server found, or the head if none are healthy. Advances
    /// the cursor to the slot after the chosen one.
    pub fn next_healthy(&self) -> Option<Arc<UpstreamServer>> {
        let snapshot = self.snapshot.load();
        if snapshot.is_empty() {
            return None;
        }
        let len = snapshot.len();
        let start = self.cursor.load(Ordering::SeqCst) % len;

        for offset in 0..len {
            let index = (start + offset) % len;
            if snapshot[index].is_healthy_cached() {
                self.cursor.store((index + 1) % len, Ordering::SeqCst);
                return Some(snapshot[index].clone());
            }
        }
        self.cursor.store((start + 1) % len, Ordering::SeqCst);
        Some(snapshot[start].clone())
    }

    /// Returns cached health if the TTL is non-positive; otherwise probes
    /// (coalesced per `(url, proxy)`) when the cache is stale.
    pub async fn health(&self, server: &Arc<UpstreamServer>, client: &ClientWithMiddleware) -> bool {
        if server.health_cache_ttl <= Duration::ZERO {
            return server.is_healthy_cached();
        }
        if !server.is_stale() {
            return server.is_healthy_cached();
        }

        let coalesce_key = format!(
            "{}|{}",
            server.url,
            server.proxy.as_ref().map(Url::as_str).unwrap_or("")
        );
        let probe_paths = self.default_probe_paths.clone();
        let server = server.clone();
        let client = client.clone();

        let result = self
            .probe_coalesce
            .get_or_try_init(coalesce_key, move || async move {
                Ok::<bool, std::convert::Infallible>(probe_server(&server, &client, &probe_paths).await)
            })
            .await;

        result.unwrap_or(false)
    }

    /// Iterates the snapshot in order, issuing `GET` with per-upstream
    /// proxy and (if given) a client `If-Modified-Since` header, returning
    /// the first `200` response. A `304` is returned as-is rather than
    /// treated as a failed attempt — per spec §4.9 case 2, an upstream
    /// `304` means the cache is still valid, not that this mirror is
    /// unreachable, so it must not fall through to the next one. Returns
    /// the chosen index for logging.
    pub async fn fetch(
        &self,
        path: &str,
        client_if_modified_since: Option<SystemTime>,
        client_for: impl Fn(Option<&Url>) -> ClientWithMiddleware,
    ) -> Result<FetchResult, UpstreamError> {
        let snapshot = self.snapshot.load();
        for (index, server) in snapshot.iter().enumerate() {
            let client = client_for(server.proxy.as_ref());
            let Ok(url) = server.url.join(path.trim_start_matches('/')) else {
                continue;
            };
            let mut request = client.get(url);
            if let Some(if_modified_since) = client_if_modified_since {
                request = request.header(
                    reqwest::header::IF_MODIFIED_SINCE,
                    httpdate::fmt_http_date(if_modified_since),
                );
            }
            match request.send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    return Ok(FetchResult::Modified(response, index));
                }
                Ok(response) if response.status() == reqwest::StatusCode::NOT_MODIFIED => {
                    return Ok(FetchResult::NotModified);
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(upstream = %server.name, error = %err, "upstream fetch failed");
                    continue;
                }
            }
        }
        Err(UpstreamError::NoAvailableUpstream(path.to_string()))
    }
}

/// Outcome of [`UpstreamPool::fetch`]: either a fetched response (with the
/// index of the mirror that served it) or confirmation that the client's
/// conditional request is still valid.
pub enum FetchResult {
    Modified(reqwest::Response, usize),
    NotModified,
}

async fn probe_server(
    server: &UpstreamServer,
    client: &ClientWithMiddleware,
    probe_paths: &[String],
) -> bool {
    for path in probe_paths {
        let Ok(url) = server.url.join(path.trim_start_matches('/')) else {
            continue;
        };
        match client.head(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                server.record_probe(true, None);
                info!(upstream = %server.name, "health probe ok");
                return true;
            }
            Ok(response) => {
                server.record_probe(false, Some(format!("status {}", response.status())));
            }
            Err(err) => {
                server.record_probe(false, Some(err.to_string()));
            }
        }
    }
    server.is_healthy_cached()
}

#[cfg(test)]
mod test {
    use super::*;

    fn server(name: &str) -> UpstreamServer {
        UpstreamServer::new(Url::parse("http://example.invalid").unwrap(), None, name)
    }

    #[test]
    fn round_robin_advances_cursor() {
        let pool = UpstreamPool::new(vec![server("a"), server("b"), server("c")], vec![]);
        let first = pool.next_healthy().unwrap();
        let second = pool.next_healthy().unwrap();
        let third = pool.next_healthy().unwrap();
        let fourth = pool.next_healthy().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
        assert_eq!(third.name, "c");
        assert_eq!(fourth.name, "a");
    }

    #[test]
    fn unhealthy_server_is_skipped_in_round_robin() {
        let unhealthy = server("down");
        unhealthy.record_probe(false, Some("boom".to_string()));
        unhealthy.record_probe(false, Some("boom".to_string()));
        unhealthy.record_probe(false, Some("boom".to_string()));
        assert!(!unhealthy.is_healthy_cached());

        let pool = UpstreamPool::new(vec![unhealthy, server("up")], vec![]);
        let chosen = pool.next_healthy().unwrap();
        assert_eq!(chosen.name, "up");
    }

    #[test]
    fn falls_back_to_head_when_all_unhealthy() {
        let a = server("a");
        for _ in 0..3 {
            a.record_probe(false, None);
        }
        let pool = UpstreamPool::new(vec![a], vec![]);
        let chosen = pool.next_healthy().unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[tokio::test]
    async fn non_positive_ttl_returns_cached_without_probing() {
        let mut srv = server("a");
        srv.health_cache_ttl = Duration::ZERO;
        let pool = UpstreamPool::new(vec![srv], vec![]);
        let snapshot = pool.snapshot();
        let client = repogate_networking::build_health_check_client(None, Duration::from_secs(1));
        // health_cache_ttl <= 0 means: return cached value, never probe.
        let healthy = pool.health(&snapshot[0], &client).await;
        assert!(healthy);
    }
}
