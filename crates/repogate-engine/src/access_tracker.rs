//! Durable key→last-access-timestamp store, authoritative over filesystem
//! atime (which mount options may suppress).
//!
//! Persists as a flat JSON sidecar (`access_times.json`) written via
//! tmp+rename, mirroring the tmp-then-promote discipline
//! `disk_cache`/`fetch` use for cache content rather than a plain
//! `serde_json::to_writer_pretty` over the live file — the rename buys
//! crash-safety for a file that's rewritten wholesale on every flush.
//! Falls back to an in-memory-only store when the sidecar directory isn't
//! writable.

use crate::types::CacheKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessTrackerError {
    #[error("failed to write access time sidecar: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to parse access time sidecar: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Durable (or in-memory-fallback) key→timestamp store.
pub struct AccessTimeTracker {
    state: RwLock<HashMap<CacheKey, u128>>,
    sidecar_path: Option<PathBuf>,
}

impl AccessTimeTracker {
    /// Opens (or creates) the tracker backed by `sidecar_path`'s parent
    /// directory. If the sidecar can't be read or the directory isn't
    /// writable, falls back silently to an in-memory-only tracker.
    pub fn open(sidecar_path: impl Into<PathBuf>) -> Self {
        let sidecar_path = sidecar_path.into();
        let state = match std::fs::read_to_string(&sidecar_path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        let writable = sidecar_path
            .parent()
            .map(|dir| dir.exists() && !dir.metadata().map(|m| m.permissions().readonly()).unwrap_or(true))
            .unwrap_or(false);
        Self {
            state: RwLock::new(state),
            sidecar_path: if writable { Some(sidecar_path) } else { None },
        }
    }

    /// Pure in-memory tracker, used when no durable sidecar is desired.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            sidecar_path: None,
        }
    }

    pub fn record(&self, key: &CacheKey) -> Result<(), AccessTrackerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.state.write().insert(key.clone(), now);
        self.flush()
    }

    pub fn get(&self, key: &CacheKey) -> Option<u128> {
        self.state.read().get(key).copied()
    }

    pub fn remove(&self, key: &CacheKey) -> Result<(), AccessTrackerError> {
        self.state.write().remove(key);
        self.flush()
    }

    pub fn size(&self) -> usize {
        self.state.read().len()
    }

    /// Removes tracker entries for keys not present in `live_keys`.
    pub fn cleanup_orphans(
        &self,
        live_keys: impl Fn(&CacheKey) -> bool,
    ) -> Result<usize, AccessTrackerError> {
        let removed;
        {
            let mut state = self.state.write();
            let before = state.len();
            state.retain(|key, _| live_keys(key));
            removed = before - state.len();
        }
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<(), AccessTrackerError> {
        let Some(path) = &self.sidecar_path else {
            return Ok(());
        };
        let snapshot = self.state.read().clone();
        let text = serde_json::to_string(&snapshot).map_err(AccessTrackerError::Parse)?;
        write_via_tmp_rename(path, &text).map_err(AccessTrackerError::Write)
    }
}

fn write_via_tmp_rename(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_and_get_round_trip() {
        let tracker = AccessTimeTracker::in_memory();
        let key = CacheKey::new_unchecked("x.apk");
        assert!(tracker.get(&key).is_none());
        tracker.record(&key).unwrap();
        assert!(tracker.get(&key).is_some());
    }

    #[test]
    fn survives_reopen_from_sidecar() {
        let dir = tempdir().unwrap();
        let sidecar = dir.path().join("access_times.json");
        let key = CacheKey::new_unchecked("x.apk");
        {
            let tracker = AccessTimeTracker::open(&sidecar);
            tracker.record(&key).unwrap();
        }
        let reopened = AccessTimeTracker::open(&sidecar);
        assert!(reopened.get(&key).is_some());
    }

    #[test]
    fn cleanup_orphans_removes_dead_keys() {
        let tracker = AccessTimeTracker::in_memory();
        let live = CacheKey::new_unchecked("live.apk");
        let dead = CacheKey::new_unchecked("dead.apk");
        tracker.record(&live).unwrap();
        tracker.record(&dead).unwrap();

        let removed = tracker.cleanup_orphans(|key| key == &live).unwrap();
        assert_eq!(removed, 1);
        assert!(tracker.get(&live).is_some());
        assert!(tracker.get(&dead).is_none());
    }

    #[test]
    fn unwritable_directory_falls_back_to_memory_only() {
        let tracker = AccessTimeTracker::open("/nonexistent-dir-xyz/access_times.json");
        let key = CacheKey::new_unchecked("x.apk");
        // Should not panic or error even though nothing can be flushed.
        tracker.record(&key).unwrap();
        assert!(tracker.get(&key).is_some());
    }
}
