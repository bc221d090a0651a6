//! Retry policy and the generic async retry executor.
//!
//! Semantics:
//! - `max_retries` counts retries, so a loop makes at most
//!   `max_retries + 1` attempts.
//! - Every failure is classified before any branch; the classifier verdict
//!   is OR-combined with an optional caller override predicate.
//! - Cancellation is checked before each attempt and raced against the
//!   backoff wait; it never waits out a sleep.
//! - On exhaustion or a terminal classification the original fault is
//!   returned decorated with the attempt count and last backoff.
//!
//! A [`RetryExecutor`] is single-flight: `invoke` takes `&mut self`, so one
//! instance drives exactly one in-flight loop. Concurrent operations each
//! own their own executor; the policy itself is immutable and shared.
//!
//! Example
//! ```rust
//! use forgewire::{RetryExecutor, RetryPolicy};
//! use forgewire::fault::Fault;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder().max_retries(2).build().unwrap();
//! let mut executor = RetryExecutor::new(policy);
//! let cancel = CancellationToken::new();
//! let result: Result<u32, Fault> =
//!     executor.invoke(|| async { Ok(42) }, &cancel).await;
//! assert_eq!(result.unwrap(), 42);
//! # });
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::backoff::exponential_backoff;
use crate::classify::TransientClassifier;
use crate::fault::Fault;
use crate::sleeper::{Sleeper, TokioSleeper};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
pub const DEFAULT_BACKOFF_COEFFICIENT: Duration = Duration::from_secs(1);

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [StatusCode; 5] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Immutable retry configuration shared by all requests of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    backoff_coefficient: Duration,
    retryable_status_codes: BTreeSet<StatusCode>,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempt budget, retries plus the initial attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn backoff_coefficient(&self) -> Duration {
        self.backoff_coefficient
    }

    pub fn retryable_status_codes(&self) -> &BTreeSet<StatusCode> {
        &self.retryable_status_codes
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Backoff for the given zero-based attempt count.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        exponential_backoff(attempt, self.min_backoff, self.max_backoff, self.backoff_coefficient)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build().expect("default retry policy is valid")
    }
}

/// Builder for [`RetryPolicy`].
///
/// Caller-specified status codes are merged into the default retryable set
/// exactly once, here; the built policy is frozen.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    backoff_coefficient: Duration,
    retryable_status_codes: BTreeSet<StatusCode>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn min_backoff(mut self, min: Duration) -> Self {
        self.min_backoff = min;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn backoff_coefficient(mut self, coefficient: Duration) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Merge additional status codes into the retryable set.
    pub fn also_retry_on<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.retryable_status_codes.extend(codes);
        self
    }

    /// Replace the retryable set entirely.
    pub fn retryable_status_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<RetryPolicy, Fault> {
        if self.min_backoff > self.max_backoff {
            return Err(Fault::configuration(format!(
                "min backoff ({:?}) exceeds max backoff ({:?})",
                self.min_backoff, self.max_backoff
            )));
        }
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            backoff_coefficient: self.backoff_coefficient,
            retryable_status_codes: self.retryable_status_codes,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one asynchronous operation through the retry loop.
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: TransientClassifier,
    retry_override: Option<Arc<dyn Fn(&Fault) -> bool + Send + Sync>>,
    sleeper: Arc<dyn Sleeper>,
    last_backoff: Option<Duration>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("classifier", &self.classifier)
            .field("retry_override", &self.retry_override.as_ref().map(|_| "<predicate>"))
            .field("last_backoff", &self.last_backoff)
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let classifier = TransientClassifier::new(&policy);
        Self {
            policy,
            classifier,
            retry_override: None,
            sleeper: Arc::new(TokioSleeper),
            last_backoff: None,
        }
    }

    /// Replace the classifier, e.g. to opt in to socket-reset retries.
    pub fn with_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Additional predicate OR-combined with the classifier verdict.
    pub fn with_retry_override<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Fault) -> bool + Send + Sync + 'static,
    {
        self.retry_override = Some(Arc::new(predicate));
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The backoff applied before the most recent attempt, if any.
    pub fn last_backoff(&self) -> Option<Duration> {
        self.last_backoff
    }

    /// Run `operation` until it succeeds, classification says stop, or the
    /// retry budget is exhausted.
    pub async fn invoke<T, Fut, Op>(
        &mut self,
        mut operation: Op,
        cancel: &CancellationToken,
    ) -> Result<T, Fault>
    where
        T: Send,
        Fut: Future<Output = Result<T, Fault>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut remaining = self.policy.max_retries();
        let mut attempts: u32 = 0;
        self.last_backoff = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Fault::cancelled("cancelled before attempt")
                    .with_retry_diagnostics(attempts, self.last_backoff));
            }

            attempts += 1;
            let fault = match operation().await {
                Ok(value) => return Ok(value),
                Err(fault) => fault,
            };

            let verdict = self.classifier.evaluate(fault, cancel.is_cancelled());
            let overridden = self
                .retry_override
                .as_ref()
                .map(|predicate| predicate(&verdict.fault))
                .unwrap_or(false);

            if !(verdict.retryable || overridden) || remaining == 0 {
                return Err(verdict
                    .fault
                    .with_retry_diagnostics(attempts, self.last_backoff));
            }

            // Zero-based attempt count; the calculator clamps 0 to 1.
            let delay = self.policy.backoff_for(attempts - 1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Fault::cancelled("cancelled during backoff wait")
                        .with_retry_diagnostics(attempts, self.last_backoff));
                }
                _ = self.sleeper.sleep(delay) => {}
            }
            self.last_backoff = Some(delay);
            remaining -= 1;
        }
    }
}
