mod admin;
mod auth;
mod metrics;
mod ratelimit;
mod routes;
mod state;
mod tunnel;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use metrics::PrometheusMetrics;
use ratelimit::RateLimiter;
use repogate_config::{Cli, Config};
use repogate_engine::disk_cache::CleanStrategy;
use repogate_engine::engine::{Engine, EngineConfig, UpstreamSpec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::load(cli.config.as_deref(), &cli)?;
    std::fs::create_dir_all(&config.cache.dir)?;

    let metrics = Arc::new(PrometheusMetrics::new());
    let engine_config = build_engine_config(&config);
    let engine = Engine::with_metrics(engine_config, metrics.clone())?;

    let rate_limiter = config.rate_limit.enabled.then(|| {
        Arc::new(RateLimiter::new(config.rate_limit.rate, config.rate_limit.burst))
    });

    spawn_background_tasks(&engine, &config);
    if let Some(limiter) = &rate_limiter {
        spawn_rate_limit_sweep(limiter.clone());
    }

    let addr: SocketAddr = config.server.addr.parse()?;
    let app_state = Arc::new(state::AppState::new(
        engine,
        config.clone(),
        metrics,
        rate_limiter,
    ));

    let app = build_router(app_state);

    tracing::info!(%addr, "repogate listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn build_router(app_state: Arc<state::AppState>) -> Router {
    let admin_routes = admin::router().layer(middleware::from_fn_with_state(
        app_state.clone(),
        auth::require_admin_auth,
    ));

    let mut proxy_routes = Router::new().fallback(routes::dispatch);
    if app_state.config.auth.proxy_user.is_some() {
        proxy_routes = proxy_routes.layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_proxy_auth,
        ));
    }
    if app_state.rate_limiter.is_some() {
        proxy_routes = proxy_routes.layer(middleware::from_fn_with_state(
            app_state.clone(),
            enforce_rate_limit,
        ));
    }

    Router::new()
        .merge(admin_routes)
        .merge(proxy_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn enforce_rate_limit(
    State(state): State<Arc<state::AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(request).await;
    };
    let exempt = state
        .config
        .rate_limit
        .exempt_paths
        .iter()
        .any(|path| request.uri().path() == path);
    if exempt || limiter.check(addr.ip()) {
        next.run(request).await
    } else {
        StatusCode::TOO_MANY_REQUESTS.into_response()
    }
}

fn build_engine_config(config: &Config) -> EngineConfig {
    let upstreams = config
        .upstreams
        .iter()
        .map(|upstream| UpstreamSpec {
            url: upstream.url.clone(),
            proxy: upstream.proxy.clone(),
            name: upstream.name.clone(),
            max_retries: 3,
            health_cache_ttl: config.health_check.interval,
        })
        .collect();

    EngineConfig {
        cache_dir: config.cache.dir.clone(),
        upstreams,
        health_probe_paths: config.health_check.probe_paths.clone(),
        index_ttl: config.cache.index_duration,
        pkg_ttl: config.cache.pkg_duration,
        disk_max_bytes: config.cache.max_size,
        disk_clean_strategy: convert_clean_strategy(&config.cache.clean_strategy),
        memory_cache_enabled: config.memory_cache.enabled,
        memory_max_bytes: config.memory_cache.size,
        memory_max_items: config.memory_cache.max_items,
        memory_ttl: config.memory_cache.ttl,
        memory_max_per_item_bytes: config.memory_cache.max_file_size,
        fetch_timeout: repogate_networking::DEFAULT_FETCH_TIMEOUT,
        health_check_timeout: config.health_check.timeout,
    }
}

fn convert_clean_strategy(strategy: &repogate_config::CleanStrategy) -> CleanStrategy {
    match strategy {
        repogate_config::CleanStrategy::Lru => CleanStrategy::Lru,
        repogate_config::CleanStrategy::Lfu => CleanStrategy::Lfu,
        repogate_config::CleanStrategy::Fifo => CleanStrategy::Fifo,
    }
}

/// Spawns one `tokio::time::interval` loop per janitor sweep, each on its
/// own configured cadence, sharing the engine's components through
/// `Engine::janitor`.
fn spawn_background_tasks(engine: &Engine, config: &Config) {
    let cleanup_interval = config.cache.cleanup_interval;
    let health_interval = config.health_check.interval;
    let integrity_interval = config.data_integrity.check_interval;
    let auto_repair = config.data_integrity.auto_repair;
    let periodic_integrity = config.data_integrity.periodic_check;

    let expiry_janitor = engine.janitor(engine.default_health_check_client());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            if let Err(err) = expiry_janitor.expiry_sweep().await {
                tracing::warn!(error = %err, "expiry sweep failed");
            }
            expiry_janitor.memo_cleanup();
            if let Err(err) = expiry_janitor.orphan_hash_cleanup().await {
                tracing::warn!(error = %err, "orphan hash cleanup failed");
            }
            expiry_janitor.lock_gc();
        }
    });

    let health_janitor = engine.janitor(engine.default_health_check_client());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            health_janitor.health_loop().await;
        }
    });

    if periodic_integrity {
        let integrity_janitor = engine.janitor(engine.default_health_check_client());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(integrity_interval.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                if let Err(err) = integrity_janitor.integrity_sweep(auto_repair).await {
                    tracing::warn!(error = %err, "integrity sweep failed");
                }
            }
        });
    }
}

/// Idle threshold for rate-limit buckets: a client silent for ten minutes
/// is assumed gone, not mid-burst.
const RATE_LIMIT_IDLE_SWEEP_AFTER: Duration = Duration::from_secs(600);

/// Periodically drops rate-limit buckets for clients that have gone
/// quiet, bounding the per-IP `DashMap` over long uptimes.
fn spawn_rate_limit_sweep(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RATE_LIMIT_IDLE_SWEEP_AFTER);
        loop {
            ticker.tick().await;
            limiter.sweep_idle(RATE_LIMIT_IDLE_SWEEP_AFTER);
        }
    });
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter().to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}
