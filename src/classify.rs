//! Transient failure classification.
//!
//! Every failure signal — a delivered status code or an error raised by the
//! send pipeline — is mapped to a [`Fault`] plus a retryability verdict
//! before any retry decision is taken. Rules are evaluated in a fixed
//! priority order; the first match wins:
//!
//! 1. status code in the policy's retryable set
//! 2. transport error with an embedded retryable status (structured code
//!    first, message text as a fallback)
//! 3. timeout
//! 4. connection reset/abort/broken pipe (opt-in, off by default: a
//!    partially transmitted response must not be blindly replayed)
//! 5. response-body I/O failure (the HTTP stage excludes this from retry;
//!    headers may already have been observed)
//! 6. service response error, retried only by its carried status
//! 7. everything else: not retryable
//!
//! The message-text sniff in rule 2 is a legacy of transports that do not
//! expose structured status codes. It lives only here so callers depend on
//! the classifier interface, not the heuristic.

use std::collections::BTreeSet;
use std::io;

use http::StatusCode;

use crate::fault::{Fault, FaultKind, ServiceResponseError};
use crate::retry::RetryPolicy;

/// Status codes rule 2 recognizes when embedded in transport error text.
const EMBEDDED_STATUS_CODES: [StatusCode; 6] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// A retryability verdict together with the classified fault.
#[derive(Debug, Clone)]
pub struct Classification {
    pub retryable: bool,
    pub fault: Fault,
}

impl Classification {
    fn retryable(fault: Fault) -> Self {
        Self { retryable: true, fault }
    }

    fn terminal(fault: Fault) -> Self {
        Self { retryable: false, fault }
    }
}

/// Classifier configured from a [`RetryPolicy`].
///
/// Holds only the policy's retryable-status set and the socket-reset
/// opt-in; it is cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct TransientClassifier {
    retryable_status_codes: BTreeSet<StatusCode>,
    retry_connection_resets: bool,
}

impl TransientClassifier {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            retryable_status_codes: policy.retryable_status_codes().clone(),
            retry_connection_resets: false,
        }
    }

    /// Opt in to retrying connection resets (rule 4). Off by default.
    pub fn with_connection_reset_retry(mut self, enabled: bool) -> Self {
        self.retry_connection_resets = enabled;
        self
    }

    pub fn retries_connection_resets(&self) -> bool {
        self.retry_connection_resets
    }

    /// Classify a status code delivered on a completed response (rule 1).
    pub fn classify_status(&self, status: StatusCode) -> Classification {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Classification::terminal(Fault::authorization(
                status,
                "request rejected by the service",
            ));
        }
        if self.retryable_status_codes.contains(&status) {
            return Classification::retryable(Fault::status(status));
        }
        Classification::terminal(Fault::status(status))
    }

    /// Classify an error raised by the send pipeline (rules 2 through 7).
    pub fn classify_error(&self, error: &reqwest_middleware::Error) -> Classification {
        let chain = error_chain(error);

        // Service response errors are matched only by their carried status;
        // their message text never feeds the rule 2 sniff.
        if let Some(service) = find_service_error(&chain) {
            let fault = Fault::status(service.status()).with_source(service.clone());
            if self.retryable_status_codes.contains(&service.status()) {
                return Classification::retryable(fault);
            }
            return Classification::terminal(fault);
        }

        // Rule 2: embedded status, structured first.
        if let Some(status) = structured_status(&chain).or_else(|| sniff_status_text(&chain)) {
            if EMBEDDED_STATUS_CODES.contains(&status) {
                return Classification::retryable(Fault::status(status));
            }
        }

        // Rule 3: timeouts.
        if is_timeout(&chain) {
            return Classification::retryable(Fault::timeout(format!(
                "request timed out: {}",
                error
            )));
        }

        // Rule 4: socket-level resets.
        if let Some(io_error) = find_socket_fault(&chain) {
            let fault = Fault::socket(io_error.raw_os_error(), io_error.to_string());
            if self.retry_connection_resets {
                return Classification::retryable(fault);
            }
            return Classification::terminal(fault);
        }

        // Rule 5: response-body I/O.
        if is_body_fault(&chain) {
            return Classification::retryable(Fault::io(format!(
                "failed reading response body: {}",
                error
            )));
        }

        // Rule 7.
        Classification::terminal(Fault::generic(error.to_string()))
    }

    /// Re-evaluate retryability for a fault that is already classified.
    ///
    /// Used by the generic retry executor, whose operations return faults
    /// rather than raw transport errors.
    pub fn is_retryable(&self, fault: &Fault) -> bool {
        match fault.kind() {
            FaultKind::StatusCode => fault
                .status_code()
                .map(|status| self.retryable_status_codes.contains(&status))
                .unwrap_or(false),
            FaultKind::Timeout | FaultKind::Io => true,
            FaultKind::Socket => self.retry_connection_resets,
            FaultKind::Authorization
            | FaultKind::Cancelled
            | FaultKind::Configuration
            | FaultKind::Generic => false,
        }
    }

    /// Resolve a classified fault against the caller's cancellation state.
    ///
    /// A cancellation fault is terminal only when the caller actually asked
    /// for it; a cancellation that fired without a caller request is an
    /// internal deadline in disguise and is reinterpreted as a retryable
    /// timeout.
    pub fn evaluate(&self, fault: Fault, cancellation_requested: bool) -> Classification {
        if fault.kind() == FaultKind::Cancelled && !cancellation_requested {
            let fault = Fault::timeout(format!(
                "cancellation without a caller request, treated as a timeout: {}",
                fault.detail()
            ));
            return Classification::retryable(fault);
        }
        let retryable = self.is_retryable(&fault);
        Classification { retryable, fault }
    }
}

impl Default for TransientClassifier {
    fn default() -> Self {
        Self::new(&RetryPolicy::default())
    }
}

/// Recover the classified fault carried inside a pipeline error, or
/// classify the error fresh with the given classifier.
///
/// The retry stage propagates terminal faults through
/// `reqwest_middleware::Error::Middleware`; callers above the pipeline use
/// this to get the original fault back out.
pub fn fault_from_send_error(
    classifier: &TransientClassifier,
    error: reqwest_middleware::Error,
) -> Fault {
    match error {
        reqwest_middleware::Error::Middleware(inner) => match inner.downcast::<Fault>() {
            Ok(fault) => fault,
            Err(other) => classifier
                .classify_error(&reqwest_middleware::Error::Middleware(other))
                .fault,
        },
        other => classifier.classify_error(&other).fault,
    }
}

fn error_chain(error: &reqwest_middleware::Error) -> Vec<&(dyn std::error::Error + 'static)> {
    match error {
        reqwest_middleware::Error::Middleware(inner) => inner.chain().collect(),
        reqwest_middleware::Error::Reqwest(inner) => {
            let mut chain: Vec<&(dyn std::error::Error + 'static)> = Vec::new();
            let mut current: Option<&(dyn std::error::Error + 'static)> = Some(inner);
            while let Some(err) = current {
                chain.push(err);
                current = err.source();
            }
            chain
        }
    }
}

fn find_service_error<'a>(
    chain: &[&'a (dyn std::error::Error + 'static)],
) -> Option<&'a ServiceResponseError> {
    chain.iter().find_map(|err| err.downcast_ref::<ServiceResponseError>())
}

fn structured_status(chain: &[&(dyn std::error::Error + 'static)]) -> Option<StatusCode> {
    chain
        .iter()
        .find_map(|err| err.downcast_ref::<reqwest::Error>().and_then(reqwest::Error::status))
}

fn sniff_status_text(chain: &[&(dyn std::error::Error + 'static)]) -> Option<StatusCode> {
    // Fragile by design: some transports only surface the status inside the
    // message text. Kept narrowly scoped to the six codes above.
    for err in chain {
        let text = err.to_string();
        for status in EMBEDDED_STATUS_CODES {
            if text.contains(status.as_str()) {
                return Some(status);
            }
        }
    }
    None
}

fn is_timeout(chain: &[&(dyn std::error::Error + 'static)]) -> bool {
    chain.iter().any(|err| {
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() {
                return true;
            }
        }
        matches!(err.downcast_ref::<io::Error>(), Some(io) if io.kind() == io::ErrorKind::TimedOut)
    })
}

fn find_socket_fault<'a>(chain: &[&'a (dyn std::error::Error + 'static)]) -> Option<&'a io::Error> {
    chain.iter().find_map(|err| {
        err.downcast_ref::<io::Error>().filter(|io| {
            matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}

fn is_body_fault(chain: &[&(dyn std::error::Error + 'static)]) -> bool {
    chain.iter().any(|err| {
        matches!(err.downcast_ref::<reqwest::Error>(), Some(req) if req.is_body() || req.is_decode())
    })
}
