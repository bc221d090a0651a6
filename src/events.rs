//! Structured send events and the observer contract.
//!
//! The retry middleware reports every attempt, retry decision, terminal
//! failure, and success-after-retry to a [`SendObserver`]. Observers replace
//! subclass tracing hooks: inject one instead of overriding the middleware.
//!
//! [`TracingObserver`] is the production observer and forwards events to
//! `tracing`; [`MemoryObserver`] buffers them for test assertions.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::fault::FaultKind;

/// Events emitted by the outbound-request retry stage.
///
/// Each event carries the request URI and the attempt position within the
/// configured budget, so a sink can reconstruct the full retry history of a
/// single logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    /// An attempt is about to be sent.
    Attempt { uri: String, method: String, attempt: u32, max_attempts: u32 },
    /// The previous attempt failed retryably; a wait of `delay` precedes the
    /// next attempt.
    Retry {
        uri: String,
        attempt: u32,
        max_attempts: u32,
        fault_kind: FaultKind,
        detail: String,
        delay: Duration,
    },
    /// The request failed terminally after `attempts` attempts.
    Failed { uri: String, attempts: u32, fault_kind: FaultKind, detail: String },
    /// The request succeeded on a retry (attempt > 1).
    Succeeded { uri: String, attempt: u32 },
}

impl fmt::Display for SendEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendEvent::Attempt { uri, method, attempt, max_attempts } => {
                write!(f, "Attempt(#{}/{}, {} {})", attempt, max_attempts, method, uri)
            }
            SendEvent::Retry { uri, attempt, max_attempts, fault_kind, detail, delay } => {
                write!(
                    f,
                    "Retry(#{}/{}, {}: {}, delay={:?}, {})",
                    attempt, max_attempts, fault_kind, detail, delay, uri
                )
            }
            SendEvent::Failed { uri, attempts, fault_kind, detail } => {
                write!(f, "Failed(attempts={}, {}: {}, {})", attempts, fault_kind, detail, uri)
            }
            SendEvent::Succeeded { uri, attempt } => {
                write!(f, "Succeeded(#{}, {})", attempt, uri)
            }
        }
    }
}

/// Observer of the retry stage's state transitions.
///
/// All methods default to no-ops so an observer implements only the
/// transitions it cares about.
pub trait SendObserver: Send + Sync + fmt::Debug {
    fn on_attempt(&self, _event: &SendEvent) {}
    fn on_retry(&self, _event: &SendEvent) {}
    fn on_failure(&self, _event: &SendEvent) {}
    fn on_success(&self, _event: &SendEvent) {}
}

/// Production observer that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SendObserver for TracingObserver {
    fn on_attempt(&self, event: &SendEvent) {
        tracing::debug!(event = %event, "send_attempt");
    }

    fn on_retry(&self, event: &SendEvent) {
        tracing::warn!(event = %event, "send_retry");
    }

    fn on_failure(&self, event: &SendEvent) {
        tracing::warn!(event = %event, "send_failed");
    }

    fn on_success(&self, event: &SendEvent) {
        tracing::info!(event = %event, "send_recovered");
    }
}

/// Test observer that buffers events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryObserver {
    events: Arc<Mutex<Vec<SendEvent>>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SendEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Number of buffered events matching `predicate`.
    pub fn count_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SendEvent) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    fn record(&self, event: &SendEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl SendObserver for MemoryObserver {
    fn on_attempt(&self, event: &SendEvent) {
        self.record(event);
    }

    fn on_retry(&self, event: &SendEvent) {
        self.record(event);
    }

    fn on_failure(&self, event: &SendEvent) {
        self.record(event);
    }

    fn on_success(&self, event: &SendEvent) {
        self.record(event);
    }
}
