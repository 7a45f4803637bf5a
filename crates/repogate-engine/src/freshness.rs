//! Decides whether a cached object is still usable without talking to
//! upstream: index files expire by mtime, package files by access time
//! (tracker, else filesystem atime, else process start), hash-addressed
//! files never expire (only digest match matters, handled by
//! [`crate::integrity`]).

use crate::access_tracker::AccessTimeTracker;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy)]
pub struct FreshnessConfig {
    pub index_ttl: Duration,
    /// `Duration::ZERO` means package files never expire by time.
    pub pkg_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    /// Freshness doesn't apply; caller must fall back to digest
    /// verification (hash-addressed paths).
    ContentAddressed,
}

/// Metadata needed to evaluate freshness for one cached file.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub mtime: SystemTime,
    pub atime: Option<SystemTime>,
}

pub struct FreshnessPolicy {
    config: FreshnessConfig,
    process_start: SystemTime,
}

impl FreshnessPolicy {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            process_start: SystemTime::now(),
        }
    }

    pub fn evaluate(
        &self,
        is_index: bool,
        is_hash_addressed: bool,
        meta: FileMeta,
        tracker: &AccessTimeTracker,
        key: &crate::types::CacheKey,
    ) -> Freshness {
        if is_hash_addressed {
            return Freshness::ContentAddressed;
        }

        let now = SystemTime::now();

        if is_index {
            let age = now.duration_since(meta.mtime).unwrap_or(Duration::ZERO);
            return if age > self.config.index_ttl {
                Freshness::Stale
            } else {
                Freshness::Fresh
            };
        }

        if self.config.pkg_ttl.is_zero() {
            return Freshness::Fresh;
        }

        let last_access = tracker
            .get(key)
            .map(nanos_to_system_time)
            .or(meta.atime)
            .unwrap_or(self.process_start);

        let age = now.duration_since(last_access).unwrap_or(Duration::ZERO);
        if age > self.config.pkg_ttl {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

fn nanos_to_system_time(nanos: u128) -> SystemTime {
    std::time::UNIX_EPOCH + Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::CacheKey;

    fn meta_at(age: Duration) -> FileMeta {
        FileMeta {
            mtime: SystemTime::now() - age,
            atime: None,
        }
    }

    #[test]
    fn hash_addressed_is_always_content_addressed() {
        let policy = FreshnessPolicy::new(FreshnessConfig {
            index_ttl: Duration::from_secs(1),
            pkg_ttl: Duration::from_secs(1),
        });
        let tracker = AccessTimeTracker::in_memory();
        let key = CacheKey::new_unchecked("by-hash/SHA256/deadbeef");
        let result = policy.evaluate(false, true, meta_at(Duration::ZERO), &tracker, &key);
        assert_eq!(result, Freshness::ContentAddressed);
    }

    #[test]
    fn index_file_expires_by_mtime() {
        let policy = FreshnessPolicy::new(FreshnessConfig {
            index_ttl: Duration::from_secs(1),
            pkg_ttl: Duration::from_secs(3600),
        });
        let tracker = AccessTimeTracker::in_memory();
        let key = CacheKey::new_unchecked("Release");

        let fresh = policy.evaluate(true, false, meta_at(Duration::ZERO), &tracker, &key);
        assert_eq!(fresh, Freshness::Fresh);

        let stale = policy.evaluate(true, false, meta_at(Duration::from_secs(2)), &tracker, &key);
        assert_eq!(stale, Freshness::Stale);
    }

    #[test]
    fn zero_pkg_ttl_never_expires() {
        let policy = FreshnessPolicy::new(FreshnessConfig {
            index_ttl: Duration::from_secs(1),
            pkg_ttl: Duration::ZERO,
        });
        let tracker = AccessTimeTracker::in_memory();
        let key = CacheKey::new_unchecked("x.apk");
        let result = policy.evaluate(
            false,
            false,
            meta_at(Duration::from_secs(1_000_000)),
            &tracker,
            &key,
        );
        assert_eq!(result, Freshness::Fresh);
    }

    #[test]
    fn tracker_record_takes_precedence_over_atime() {
        let policy = FreshnessPolicy::new(FreshnessConfig {
            index_ttl: Duration::from_secs(1),
            pkg_ttl: Duration::from_secs(10),
        });
        let tracker = AccessTimeTracker::in_memory();
        let key = CacheKey::new_unchecked("x.apk");
        tracker.record(&key).unwrap();

        let mut meta = meta_at(Duration::from_secs(1000));
        meta.atime = Some(SystemTime::now() - Duration::from_secs(1000));

        let result = policy.evaluate(false, false, meta, &tracker, &key);
        assert_eq!(result, Freshness::Fresh);
    }
}
