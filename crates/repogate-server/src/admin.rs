//! Admin surface: dashboard HTML, JSON stats, cache clear, integrity
//! check/repair, health, and Prometheus metrics. Everything here is a
//! thin read/trigger layer over the [`Engine`](repogate_engine::engine::Engine).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use humansize::{format_size, DECIMAL};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/_admin/", get(dashboard))
        .route("/_admin/stats", get(stats))
        .route("/_admin/clear", post(clear))
        .route("/_admin/data-integrity/check", post(integrity_check))
        .route("/_admin/data-integrity/repair", post(integrity_repair))
        .route("/_health", get(health))
        .route("/metrics", get(metrics))
}

#[derive(Serialize)]
struct Stats {
    uptime_seconds: u64,
    memory_hits: u64,
    disk_hits: u64,
    misses: u64,
    memory_cache_items: usize,
    memory_cache_bytes: u64,
    disk_cache_bytes: u64,
    disk_cache_max_bytes: u64,
    in_flight_locks: usize,
    upstreams: Vec<UpstreamStats>,
}

#[derive(Serialize)]
struct UpstreamStats {
    name: String,
    url: String,
    healthy: bool,
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    let upstreams = state
        .engine
        .upstreams()
        .snapshot()
        .iter()
        .map(|server| UpstreamStats {
            name: server.name.clone(),
            url: server.url.to_string(),
            healthy: server.is_healthy_cached(),
        })
        .collect();

    Json(Stats {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        memory_hits: state.metrics.memory_hit_count(),
        disk_hits: state.metrics.disk_hit_count(),
        misses: state.metrics.miss_count(),
        memory_cache_items: state.engine.memory().len(),
        memory_cache_bytes: state.engine.memory().total_bytes(),
        disk_cache_bytes: state.engine.quota().current_size(),
        disk_cache_max_bytes: state.config.cache.max_size,
        in_flight_locks: state.engine.in_flight_locks(),
        upstreams,
    })
}

async fn clear(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.clear().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "admin clear failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize)]
struct IntegrityReport {
    checked: usize,
    corrupt: usize,
}

async fn integrity_check(State(state): State<Arc<AppState>>) -> Json<IntegrityReport> {
    let integrity = state.engine.integrity().clone();
    let (checked, corrupt) = tokio::task::spawn_blocking(move || integrity.sweep(false))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or((0, 0));
    Json(IntegrityReport { checked, corrupt })
}

async fn integrity_repair(State(state): State<Arc<AppState>>) -> Json<IntegrityReport> {
    let integrity = state.engine.integrity().clone();
    let (checked, corrupt) = tokio::task::spawn_blocking(move || integrity.sweep(true))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or((0, 0));
    Json(IntegrityReport { checked, corrupt })
}

#[derive(Serialize)]
struct HealthUpstream {
    healthy: usize,
    total: usize,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    upstream: HealthUpstream,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.engine.upstreams().snapshot();
    let total = snapshot.len();
    let healthy = snapshot.iter().filter(|s| s.is_healthy_cached()).count();

    let status = if total == 0 || healthy > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthBody {
            status: if status == StatusCode::OK { "ok" } else { "unhealthy" },
            upstream: HealthUpstream { healthy, total },
        }),
    )
        .into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    let upstream_rows: String = state
        .engine
        .upstreams()
        .snapshot()
        .iter()
        .map(|server| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                server.name,
                server.url,
                if server.is_healthy_cached() { "healthy" } else { "unhealthy" }
            )
        })
        .collect();

    Html(format!(
        "<!doctype html><html><head><title>repogate</title></head><body>\
         <h1>repogate admin</h1>\
         <p>uptime: {}s</p>\
         <p>disk cache: {} / {}</p>\
         <table border=\"1\"><tr><th>upstream</th><th>url</th><th>status</th></tr>{}</table>\
         </body></html>",
        state.started_at.elapsed().as_secs(),
        format_size(state.engine.quota().current_size(), DECIMAL),
        format_size(state.config.cache.max_size, DECIMAL),
        upstream_rows
    ))
}
