//! Bridges client `If-Modified-Since` conditional requests, upstream
//! `304` responses, and the APT-specific `ClientValidatorMemo` that lets
//! a second client's `304` be answered without re-touching upstream.
//!
//! Generalizes an `ETag`/`Last-Modified` round trip into a three-way
//! bridge: client, cache, and upstream each get their own validator
//! comparison.

use crate::types::CacheKey;
use httpdate::{fmt_http_date, parse_http_date};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOutcome {
    /// Serve the full body.
    Full,
    /// Respond `304 Not Modified` without a body.
    NotModified,
}

#[derive(Clone, Copy)]
struct MemoValue {
    earliest: SystemTime,
    created_at: Instant,
}

/// `cacheFile → {earliest If-Modified-Since seen, created_at}`, used to
/// answer client `304`s without reverifying upstream. TTL matches
/// `index_ttl`.
pub struct ClientValidatorMemo {
    entries: RwLock<HashMap<CacheKey, MemoValue>>,
    ttl: Duration,
}

impl ClientValidatorMemo {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Records that upstream returned `304` for `client_if_modified_since`,
    /// keeping the earliest date ever seen for this key.
    pub fn record(&self, key: &CacheKey, client_if_modified_since: SystemTime) {
        let mut entries = self.entries.write();
        entries
            .entry(key.clone())
            .and_modify(|existing| {
                if client_if_modified_since < existing.earliest {
                    existing.earliest = client_if_modified_since;
                }
            })
            .or_insert(MemoValue {
                earliest: client_if_modified_since,
                created_at: Instant::now(),
            });
    }

    /// Returns `true` if a client `If-Modified-Since` of
    /// `client_if_modified_since` can be answered `304` purely from the
    /// memo (without asking upstream again).
    pub fn satisfies(&self, key: &CacheKey, client_if_modified_since: SystemTime) -> bool {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(value) if value.created_at.elapsed() <= self.ttl => {
                client_if_modified_since >= value.earliest
            }
            _ => false,
        }
    }

    /// Drops entries older than the configured TTL.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, value| value.created_at.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

pub fn parse_if_modified_since(header_value: &str) -> Option<SystemTime> {
    parse_http_date(header_value).ok()
}

pub fn format_last_modified(time: SystemTime) -> String {
    fmt_http_date(time)
}

/// Client→cache bridging: decides whether a request with
/// `If-Modified-Since: client_ims` against a cached object last modified
/// at `cached_last_modified` can be answered `304`.
pub fn evaluate_client_to_cache(
    client_ims: Option<SystemTime>,
    cached_last_modified: SystemTime,
    is_apt: bool,
    key: &CacheKey,
    memo: &ClientValidatorMemo,
) -> ConditionalOutcome {
    if let Some(client_ims) = client_ims {
        if cached_last_modified <= client_ims {
            return ConditionalOutcome::NotModified;
        }
        if is_apt && memo.satisfies(key, client_ims) {
            return ConditionalOutcome::NotModified;
        }
    }
    ConditionalOutcome::Full
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn days_ago(days: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(days * 86400)
    }

    #[test]
    fn client_ims_covering_cache_returns_not_modified() {
        let memo = ClientValidatorMemo::new(Duration::from_secs(3600));
        let key = CacheKey::new_unchecked("Release");
        let last_modified = days_ago(5);
        let client_ims = days_ago(1); // later than last_modified

        let outcome = evaluate_client_to_cache(Some(client_ims), last_modified, false, &key, &memo);
        assert_eq!(outcome, ConditionalOutcome::NotModified);
    }

    #[test]
    fn stale_client_ims_serves_full_body() {
        let memo = ClientValidatorMemo::new(Duration::from_secs(3600));
        let key = CacheKey::new_unchecked("Release");
        let last_modified = days_ago(1);
        let client_ims = days_ago(5); // earlier than last_modified

        let outcome = evaluate_client_to_cache(Some(client_ims), last_modified, false, &key, &memo);
        assert_eq!(outcome, ConditionalOutcome::Full);
    }

    #[test]
    fn memo_answers_304_without_upstream_for_apt() {
        let memo = ClientValidatorMemo::new(Duration::from_secs(3600));
        let key = CacheKey::new_unchecked("apt/example.com/dists/stable/Release");

        let first_client_ims = SystemTime::UNIX_EPOCH + Duration::from_secs(1_764_641_616); // Tue 02 Dec 2025
        memo.record(&key, first_client_ims);

        let second_client_ims = first_client_ims + Duration::from_secs(86400 * 2);
        let cached_last_modified = first_client_ims - Duration::from_secs(3600); // older than both

        // Scenario S3: second client's IMS is later, cache's own
        // last-modified wouldn't alone justify a 304 under normal rules
        // because the memo entry, not freshness, is what's being tested.
        let outcome = evaluate_client_to_cache(
            Some(second_client_ims),
            cached_last_modified,
            true,
            &key,
            &memo,
        );
        assert_eq!(outcome, ConditionalOutcome::NotModified);
    }

    #[test]
    fn memo_keeps_earliest_seen_date() {
        let memo = ClientValidatorMemo::new(Duration::from_secs(3600));
        let key = CacheKey::new_unchecked("Release");
        let later = days_ago(1);
        let earlier = days_ago(5);

        memo.record(&key, later);
        memo.record(&key, earlier);

        assert!(memo.satisfies(&key, earlier));
    }

    #[test]
    fn cleanup_expired_drops_old_entries() {
        let memo = ClientValidatorMemo::new(Duration::ZERO);
        let key = CacheKey::new_unchecked("Release");
        memo.record(&key, days_ago(1));
        std::thread::sleep(Duration::from_millis(5));
        let removed = memo.cleanup_expired();
        assert_eq!(removed, 1);
        assert_eq!(memo.len(), 0);
    }
}
