//! HTTP client construction for talking to upstream package mirrors.
//!
//! Two client flavors are built from the same base: a fetch client with a
//! generous deadline and retry policy for package/index downloads, and a
//! health-probe client with its own shorter timeout and no retries (the
//! caller decides how to interpret failures, per-server, itself).

pub mod retry_policies {
    //! Reexports the [`RetryPolicy`] trait and implementations, plus a
    //! policy that never retries, for callers that want to opt out.
    pub use retry_policies::{policies::*, Jitter, RetryDecision, RetryPolicy};
    use std::time::SystemTime;

    #[derive(Clone, Copy)]
    pub struct DoNotRetryPolicy;

    impl RetryPolicy for DoNotRetryPolicy {
        fn should_retry(&self, _: SystemTime, _: u32) -> RetryDecision {
            RetryDecision::DoNotRetry
        }
    }
}

use reqwest_middleware::ClientWithMiddleware;
use retry_policies::policies::ExponentialBackoff;
use std::time::Duration;
use url::Url;

/// Default per-request deadline for upstream fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for health probes.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the client used for package/index fetches: a 30s deadline and a
/// bounded exponential-backoff retry policy for transient failures.
pub fn build_fetch_client(proxy: Option<&Url>, timeout: Duration) -> ClientWithMiddleware {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url.as_str()) {
            builder = builder.proxy(proxy);
        }
    }
    let inner = builder.build().unwrap_or_else(|_| reqwest::Client::new());
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    reqwest_middleware::ClientBuilder::new(inner)
        .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(
            retry_policy,
        ))
        .build()
}

/// Builds the client used for `UpstreamPool` health probes: short timeout,
/// no retries (the pool itself owns retry/backoff semantics via
/// `retry_count`/`max_retries`).
pub fn build_health_check_client(proxy: Option<&Url>, timeout: Duration) -> ClientWithMiddleware {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy {
        if let Ok(proxy) = reqwest::Proxy::all(proxy_url.as_str()) {
            builder = builder.proxy(proxy);
        }
    }
    let inner = builder.build().unwrap_or_else(|_| reqwest::Client::new());
    reqwest_middleware::ClientBuilder::new(inner).build()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn fetch_client_builds_without_proxy() {
        let client = build_fetch_client(None, DEFAULT_FETCH_TIMEOUT);
        // Smoke-test that the middleware stack is assembled; no network call.
        drop(client);
    }

    #[tokio::test]
    async fn health_check_client_builds_with_proxy() {
        let proxy = Url::parse("http://127.0.0.1:8080").unwrap();
        let client = build_health_check_client(Some(&proxy), DEFAULT_HEALTH_CHECK_TIMEOUT);
        drop(client);
    }
}
