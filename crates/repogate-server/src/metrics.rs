//! Prometheus exposition sink. Implements the engine's narrow [`Metrics`]
//! trait and separately renders itself as `/metrics` text, keeping the
//! engine itself ignorant of any particular metrics backend.

use repogate_engine::metrics::Metrics;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PrometheusMetrics {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    upstream_fallbacks: AtomicU64,
    downloaded_bytes: AtomicU64,
    integrity_mismatches: AtomicU64,
    quota_refusals: AtomicU64,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_hit_count(&self) -> u64 {
        self.memory_hits.load(Ordering::Relaxed)
    }

    pub fn disk_hit_count(&self) -> u64 {
        self.disk_hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Renders every counter in Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP repogate_memory_hits_total Requests served from the in-process memory cache.\n\
             # TYPE repogate_memory_hits_total counter\n\
             repogate_memory_hits_total {}\n\
             # HELP repogate_disk_hits_total Requests served from the on-disk cache.\n\
             # TYPE repogate_disk_hits_total counter\n\
             repogate_disk_hits_total {}\n\
             # HELP repogate_misses_total Requests that required an upstream fetch.\n\
             # TYPE repogate_misses_total counter\n\
             repogate_misses_total {}\n\
             # HELP repogate_upstream_fallbacks_total Times a non-primary upstream served a request.\n\
             # TYPE repogate_upstream_fallbacks_total counter\n\
             repogate_upstream_fallbacks_total {}\n\
             # HELP repogate_downloaded_bytes_total Bytes streamed from upstreams.\n\
             # TYPE repogate_downloaded_bytes_total counter\n\
             repogate_downloaded_bytes_total {}\n\
             # HELP repogate_integrity_mismatches_total Digest verification failures.\n\
             # TYPE repogate_integrity_mismatches_total counter\n\
             repogate_integrity_mismatches_total {}\n\
             # HELP repogate_quota_refusals_total Admissions refused after cleanup.\n\
             # TYPE repogate_quota_refusals_total counter\n\
             repogate_quota_refusals_total {}\n",
            self.memory_hits.load(Ordering::Relaxed),
            self.disk_hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.upstream_fallbacks.load(Ordering::Relaxed),
            self.downloaded_bytes.load(Ordering::Relaxed),
            self.integrity_mismatches.load(Ordering::Relaxed),
            self.quota_refusals.load(Ordering::Relaxed),
        )
    }
}

impl Metrics for PrometheusMetrics {
    fn memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn upstream_fallback(&self, _upstream_index: usize) {
        self.upstream_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn downloaded_bytes(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn integrity_mismatch(&self) {
        self.integrity_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn quota_refused(&self) {
        self.quota_refusals.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_includes_every_counter_name() {
        let metrics = PrometheusMetrics::new();
        metrics.memory_hit();
        metrics.disk_hit();
        metrics.miss();
        let text = metrics.render();
        assert!(text.contains("repogate_memory_hits_total 1"));
        assert!(text.contains("repogate_disk_hits_total 1"));
        assert!(text.contains("repogate_misses_total 1"));
    }
}
