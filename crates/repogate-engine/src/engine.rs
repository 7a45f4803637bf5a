//! The `Engine` aggregate: owns every stateful component and is the one
//! object a binary needs to construct at startup. `Clone` is cheap (an
//! `Arc` wrapper around the shared inner state), so request handlers and
//! background tasks can share one instance without any of them reaching
//! back into `RequestHandler`: each sub-component is exposed through its
//! own narrow module, and `Engine` is the only thing that composes them.

use crate::access_tracker::AccessTimeTracker;
use crate::conditional::ClientValidatorMemo;
use crate::disk_cache::{CleanStrategy, DiskCache, DiskQuota};
use crate::fetch::FetchCoordinator;
use crate::freshness::{FreshnessConfig, FreshnessPolicy};
use crate::handler::{HandlerError, HandlerOutcome, RequestHandler};
use crate::integrity::IntegrityStore;
use crate::janitor::Janitor;
use crate::memory_cache::{MemoryCache, MemoryCacheConfig};
use crate::metrics::{Metrics, NoopMetrics};
use crate::upstream::{UpstreamPool, UpstreamServer};
use reqwest_middleware::ClientWithMiddleware;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use url::Url;

/// One upstream mirror, as the engine needs to know it (no config-crate
/// dependency here; `repogate-server` maps its own `Config` into this).
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    pub url: Url,
    pub proxy: Option<Url>,
    pub name: String,
    pub max_retries: u32,
    pub health_cache_ttl: Duration,
}

/// Plain construction parameters for [`Engine`]. Kept free of any
/// CLI/TOML concerns so this crate has no dependency on `repogate-config`;
/// the binary crate is responsible for turning its own `Config` into one
/// of these.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    pub upstreams: Vec<UpstreamSpec>,
    pub health_probe_paths: Vec<String>,
    pub index_ttl: Duration,
    pub pkg_ttl: Duration,
    pub disk_max_bytes: u64,
    pub disk_clean_strategy: CleanStrategy,
    pub memory_cache_enabled: bool,
    pub memory_max_bytes: u64,
    pub memory_max_items: usize,
    pub memory_ttl: Duration,
    pub memory_max_per_item_bytes: u64,
    pub fetch_timeout: Duration,
    pub health_check_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/repogate"),
            upstreams: Vec::new(),
            health_probe_paths: vec!["/".to_string()],
            index_ttl: Duration::from_secs(3600),
            pkg_ttl: Duration::from_secs(30 * 24 * 3600),
            disk_max_bytes: 10 * 1024 * 1024 * 1024,
            disk_clean_strategy: CleanStrategy::Lru,
            memory_cache_enabled: true,
            memory_max_bytes: 256 * 1024 * 1024,
            memory_max_items: 4096,
            memory_ttl: Duration::from_secs(600),
            memory_max_per_item_bytes: 8 * 1024 * 1024,
            fetch_timeout: repogate_networking::DEFAULT_FETCH_TIMEOUT,
            health_check_timeout: repogate_networking::DEFAULT_HEALTH_CHECK_TIMEOUT,
        }
    }
}

struct Inner {
    cache_dir: PathBuf,
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    quota: Arc<DiskQuota>,
    freshness: Arc<FreshnessPolicy>,
    integrity: Arc<IntegrityStore>,
    access_tracker: Arc<AccessTimeTracker>,
    memo: Arc<ClientValidatorMemo>,
    upstreams: Arc<UpstreamPool>,
    locks: Arc<crate::lock_registry::FileLockRegistry>,
    fetch: Arc<FetchCoordinator>,
    handler: RequestHandler,
    fetch_timeout: Duration,
    health_check_timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

/// The composed engine: every stateful component, cheaply cloneable.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Builds an `Engine` from `config`, sweeping the cache tree once so
    /// `DiskQuota::current_size` starts equal to the actual on-disk sum.
    pub fn new(config: EngineConfig) -> std::io::Result<Self> {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: EngineConfig, metrics: Arc<dyn Metrics>) -> std::io::Result<Self> {
        let memory = Arc::new(MemoryCache::new(MemoryCacheConfig {
            max_bytes: config.memory_max_bytes,
            max_items: if config.memory_cache_enabled {
                config.memory_max_items
            } else {
                0
            },
            ttl: config.memory_ttl,
            max_per_item_bytes: config.memory_max_per_item_bytes,
        }));
        let disk = Arc::new(DiskCache::new(&config.cache_dir));
        let quota = Arc::new(DiskQuota::new(
            &config.cache_dir,
            config.disk_max_bytes,
            config.disk_clean_strategy,
        ));
        quota.initialize()?;

        let freshness = Arc::new(FreshnessPolicy::new(FreshnessConfig {
            index_ttl: config.index_ttl,
            pkg_ttl: config.pkg_ttl,
        }));
        let integrity = Arc::new(IntegrityStore::new(&config.cache_dir));
        let access_tracker = Arc::new(AccessTimeTracker::open(
            config.cache_dir.join("access_times.json"),
        ));
        let memo = Arc::new(ClientValidatorMemo::new(config.index_ttl));

        let servers: Vec<UpstreamServer> = config
            .upstreams
            .iter()
            .map(|spec| {
                let mut server = UpstreamServer::new(spec.url.clone(), spec.proxy.clone(), spec.name.clone());
                server.max_retries = spec.max_retries;
                server.health_cache_ttl = spec.health_cache_ttl;
                server
            })
            .collect();
        let upstreams = Arc::new(UpstreamPool::new(servers, config.health_probe_paths.clone()));

        let locks = Arc::new(crate::lock_registry::FileLockRegistry::new());
        let fetch = Arc::new(FetchCoordinator::new(
            locks.clone(),
            upstreams.clone(),
            disk.clone(),
            quota.clone(),
            memory.clone(),
            integrity.clone(),
            access_tracker.clone(),
            memo.clone(),
            metrics.clone(),
            config.memory_cache_enabled,
        ));

        let handler = RequestHandler::new(
            memory.clone(),
            disk.clone(),
            freshness.clone(),
            integrity.clone(),
            access_tracker.clone(),
            memo.clone(),
            fetch.clone(),
            metrics.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                cache_dir: config.cache_dir,
                memory,
                disk,
                quota,
                freshness,
                integrity,
                access_tracker,
                memo,
                upstreams,
                locks,
                fetch,
                handler,
                fetch_timeout: config.fetch_timeout,
                health_check_timeout: config.health_check_timeout,
                metrics,
            }),
        })
    }

    /// Handles one cacheable `GET`/`HEAD`. `proxy` selects which upstream
    /// client to use (per-upstream proxy, chosen by the caller once an
    /// upstream is picked inside the fetch path).
    pub async fn handle(
        &self,
        host: &str,
        path: &str,
        client_if_modified_since: Option<SystemTime>,
    ) -> Result<HandlerOutcome, HandlerError> {
        let fetch_timeout = self.inner.fetch_timeout;
        self.inner
            .handler
            .handle(host, path, client_if_modified_since, move |proxy| {
                repogate_networking::build_fetch_client(proxy, fetch_timeout)
            })
            .await
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.inner.cache_dir
    }

    pub fn memory(&self) -> &Arc<MemoryCache> {
        &self.inner.memory
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.inner.disk
    }

    pub fn quota(&self) -> &Arc<DiskQuota> {
        &self.inner.quota
    }

    pub fn integrity(&self) -> &Arc<IntegrityStore> {
        &self.inner.integrity
    }

    pub fn upstreams(&self) -> &Arc<UpstreamPool> {
        &self.inner.upstreams
    }

    pub fn access_tracker(&self) -> &Arc<AccessTimeTracker> {
        &self.inner.access_tracker
    }

    pub fn metrics(&self) -> Arc<dyn Metrics> {
        self.inner.metrics.clone()
    }

    /// Builds a [`Janitor`] that shares this engine's components. Kept
    /// separate from `Engine` itself (rather than a method that runs
    /// sweeps directly) so the caller decides the schedule for the
    /// background janitor and health-check loops.
    pub fn janitor(&self, health_check_client: ClientWithMiddleware) -> Janitor {
        Janitor::new(
            self.inner.cache_dir.clone(),
            self.inner.freshness.clone(),
            self.inner.access_tracker.clone(),
            self.inner.integrity.clone(),
            self.inner.quota.clone(),
            self.inner.upstreams.clone(),
            self.inner.memo.clone(),
            self.inner.locks.clone(),
            health_check_client,
        )
    }

    pub fn default_health_check_client(&self) -> ClientWithMiddleware {
        repogate_networking::build_health_check_client(None, self.inner.health_check_timeout)
    }

    /// Number of live per-key locks, exposed for the admin stats surface.
    pub fn in_flight_locks(&self) -> usize {
        self.inner.locks.size()
    }

    /// Recursive clear + tracker reset + quota reset, backing the admin
    /// `/_admin/clear` endpoint.
    pub async fn clear(&self) -> std::io::Result<()> {
        self.inner.disk.clear().await?;
        self.inner.memory.clear();
        self.inner.quota.reset();
        let _ = self
            .inner
            .access_tracker
            .cleanup_orphans(|_| false);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn config_over(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            cache_dir: dir.to_path_buf(),
            upstreams: vec![UpstreamSpec {
                url: Url::parse("http://example.invalid").unwrap(),
                proxy: None,
                name: "test".to_string(),
                max_retries: 3,
                health_cache_ttl: Duration::from_secs(60),
            }],
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn new_initializes_quota_from_existing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.apk"), vec![0u8; 1234]).unwrap();

        let engine = Engine::new(config_over(dir.path())).unwrap();
        assert_eq!(engine.quota().current_size(), 1234);
    }

    #[tokio::test]
    async fn handle_serves_fresh_disk_entry() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.apk"), b"package-bytes").unwrap();
        let engine = Engine::new(config_over(dir.path())).unwrap();

        let outcome = engine.handle("example.com", "/x.apk", None).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::DiskHit { .. }));
    }

    #[tokio::test]
    async fn clear_empties_disk_and_memory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.apk"), b"package-bytes").unwrap();
        let engine = Engine::new(config_over(dir.path())).unwrap();

        engine.clear().await.unwrap();
        assert!(!dir.path().join("x.apk").exists());
        assert_eq!(engine.quota().current_size(), 0);
    }

    #[test]
    fn janitor_shares_engine_components() {
        let dir = tempdir().unwrap();
        let engine = Engine::new(config_over(dir.path())).unwrap();
        let client = engine.default_health_check_client();
        let _janitor = engine.janitor(client);
    }
}
