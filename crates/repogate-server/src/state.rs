//! Shared application state handed to every axum handler.

use crate::metrics::PrometheusMetrics;
use crate::ratelimit::RateLimiter;
use repogate_config::Config;
use repogate_engine::engine::Engine;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub engine: Engine,
    pub config: Config,
    pub metrics: Arc<PrometheusMetrics>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        engine: Engine,
        config: Config,
        metrics: Arc<PrometheusMetrics>,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            engine,
            config,
            metrics,
            rate_limiter,
            started_at: Instant::now(),
        }
    }
}
