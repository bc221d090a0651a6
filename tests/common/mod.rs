//! Shared fixtures for the integration suites.

use std::sync::Arc;
use std::time::Duration;

use forgewire::{
    ClientOptions, ForgeClient, InstantSleeper, MemoryObserver, RetryPolicy,
};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;

/// Minimal concrete client, standing in for a generated service client.
pub struct TestClient {
    http: ClientWithMiddleware,
    base_url: Url,
}

impl ForgeClient for TestClient {
    const CAPABILITY: &'static str = "build";

    fn from_pipeline(http: ClientWithMiddleware, base_url: Url) -> Self {
        Self { http, base_url }
    }

    fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn http(&self) -> &ClientWithMiddleware {
        &self.http
    }
}

/// Fast retry policy for tests; waits are skipped by [`InstantSleeper`]
/// anyway.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .min_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(20))
        .backoff_coefficient(Duration::from_millis(1))
        .build()
        .expect("test policy")
}

/// Options wired for deterministic tests: instant sleeps, buffering
/// observer.
pub fn fast_options(max_retries: u32, observer: &MemoryObserver) -> ClientOptions {
    ClientOptions::new()
        .policy(fast_policy(max_retries))
        .sleeper(Arc::new(InstantSleeper))
        .observer(Arc::new(observer.clone()))
}
