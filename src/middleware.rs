//! Outbound request retry stage.
//!
//! [`RetrySendMiddleware`] intercepts every send made through a pipeline
//! built by the client factory. It re-executes the whole remaining pipeline
//! on retry, so caller-registered stages run again with the replayed
//! request.
//!
//! Differences from the generic executor:
//! - a delivered response with a retryable status is itself a retry
//!   trigger; any other delivered response is returned untouched,
//! - response-body I/O faults are never retried here (the caller may
//!   already have observed the headers),
//! - when a status-code trigger exhausts the budget the *last response* is
//!   handed to the caller; thrown failures propagate the decorated fault,
//! - connection resets retry only under the environment opt-in, read once
//!   at construction,
//! - requests whose bodies cannot be replayed are sent exactly once.
//!
//! The middleware holds no per-request state; attempt counters live on the
//! stack of each send, so one instance serves any number of concurrent
//! requests.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Error, Middleware, Next};

use crate::classify::TransientClassifier;
use crate::events::{SendEvent, SendObserver, TracingObserver};
use crate::fault::{Fault, FaultKind};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Environment switch that opts in to retrying connection resets.
/// Recognized truthy values: `1`, `true`, `yes` (case-insensitive).
pub const RETRY_CONNECTION_RESET_ENV: &str = "FORGEWIRE_RETRY_CONNECTION_RESET";

/// Retry stage for outbound HTTP sends.
#[derive(Clone)]
pub struct RetrySendMiddleware {
    policy: RetryPolicy,
    classifier: TransientClassifier,
    sleeper: Arc<dyn Sleeper>,
    observer: Arc<dyn SendObserver>,
}

impl fmt::Debug for RetrySendMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySendMiddleware")
            .field("policy", &self.policy)
            .field("classifier", &self.classifier)
            .field("sleeper", &"<sleeper>")
            .field("observer", &"<observer>")
            .finish()
    }
}

impl RetrySendMiddleware {
    /// Build the stage from a policy, reading the socket-reset environment
    /// switch once, now.
    pub fn from_policy(policy: RetryPolicy) -> Self {
        let resets = env_flag(RETRY_CONNECTION_RESET_ENV);
        let classifier =
            TransientClassifier::new(&policy).with_connection_reset_retry(resets);
        Self {
            policy,
            classifier,
            sleeper: Arc::new(TokioSleeper),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Programmatic override of the socket-reset opt-in.
    pub fn retry_connection_resets(mut self, enabled: bool) -> Self {
        self.classifier = self.classifier.with_connection_reset_retry(enabled);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SendObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &TransientClassifier {
        &self.classifier
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).map(|v| v.to_ascii_lowercase()),
        Ok(v) if v == "1" || v == "true" || v == "yes"
    )
}

// Per-attempt outcome, internal to the send loop.
enum AttemptOutcome {
    Deliver(Response),
    Failed { fault: Fault, response: Option<Response>, force_terminal: bool },
}

#[async_trait::async_trait]
impl Middleware for RetrySendMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response, Error> {
        let uri = req.url().to_string();
        let method = req.method().to_string();
        let max_attempts = self.policy.max_attempts();
        let mut last_backoff: Option<Duration> = None;

        for attempt in 1..=max_attempts {
            self.observer.on_attempt(&SendEvent::Attempt {
                uri: uri.clone(),
                method: method.clone(),
                attempt,
                max_attempts,
            });

            let replay = match req.try_clone() {
                Some(clone) => clone,
                // A body that cannot be replayed is sent exactly once.
                None => return next.run(req, extensions).await,
            };

            let outcome = match next.clone().run(replay, extensions).await {
                Ok(response) => {
                    let status = response.status();
                    if !self.policy.is_retryable_status(status) {
                        if attempt > 1 {
                            self.observer.on_success(&SendEvent::Succeeded {
                                uri: uri.clone(),
                                attempt,
                            });
                        }
                        AttemptOutcome::Deliver(response)
                    } else {
                        let verdict = self.classifier.classify_status(status);
                        AttemptOutcome::Failed {
                            fault: verdict.fault,
                            response: Some(response),
                            force_terminal: false,
                        }
                    }
                }
                Err(error) => {
                    let mut verdict = self.classifier.classify_error(&error);
                    // Body I/O faults are excluded here: the headers may
                    // already have been delivered to the caller.
                    if verdict.fault.kind() == FaultKind::Io {
                        verdict.retryable = false;
                    }
                    AttemptOutcome::Failed {
                        fault: verdict.fault,
                        response: None,
                        force_terminal: !verdict.retryable,
                    }
                }
            };

            match outcome {
                AttemptOutcome::Deliver(response) => return Ok(response),
                AttemptOutcome::Failed { fault, response, force_terminal } => {
                    let terminal = force_terminal || attempt == max_attempts;
                    if terminal {
                        let fault = fault.with_retry_diagnostics(attempt, last_backoff);
                        self.observer.on_failure(&SendEvent::Failed {
                            uri: uri.clone(),
                            attempts: attempt,
                            fault_kind: fault.kind(),
                            detail: fault.detail().to_string(),
                        });
                        return match response {
                            // Status-code trigger: the caller still gets the
                            // last response; diagnostics went to the observer.
                            Some(response) => Ok(response),
                            None => Err(Error::Middleware(anyhow::Error::new(fault))),
                        };
                    }

                    let delay = self.policy.backoff_for(attempt - 1);
                    self.observer.on_retry(&SendEvent::Retry {
                        uri: uri.clone(),
                        attempt,
                        max_attempts,
                        fault_kind: fault.kind(),
                        detail: fault.detail().to_string(),
                        delay,
                    });
                    self.sleeper.sleep(delay).await;
                    last_backoff = Some(delay);
                }
            }
        }

        // The loop always returns: every attempt either delivers, fails
        // terminally, or schedules another iteration within the budget.
        unreachable!("retry loop exited without a terminal outcome")
    }
}
