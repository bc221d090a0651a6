//! Fault model for the resilience layer.
//!
//! Every failure observed by the retry components is classified exactly once
//! into a [`Fault`] before any retry/no-retry branch is taken. On exhaustion
//! the original fault is decorated in place with attempt diagnostics rather
//! than wrapped, so callers can still inspect its kind, status code, and
//! detail after the retry loop gives up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

/// Broad classification of a failure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The service answered with an HTTP status code.
    StatusCode,
    /// The operation exceeded a deadline.
    Timeout,
    /// The connection was reset, aborted, or the pipe broke mid-transfer.
    Socket,
    /// An I/O failure while reading a response body.
    Io,
    /// The service rejected the caller's identity (401/403).
    Authorization,
    /// The caller's cancellation signal fired.
    Cancelled,
    /// Invalid client or pipeline configuration. Never retried.
    Configuration,
    /// Anything the classifier could not place in a more specific bucket.
    Generic,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::StatusCode => "status-code",
            FaultKind::Timeout => "timeout",
            FaultKind::Socket => "socket",
            FaultKind::Io => "io",
            FaultKind::Authorization => "authorization",
            FaultKind::Cancelled => "cancelled",
            FaultKind::Configuration => "configuration",
            FaultKind::Generic => "generic",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
///
/// Built by the [`classify`](crate::classify) module (or directly by
/// operations that already know what went wrong) and carried unchanged
/// through the retry loops. `attempts` and `last_backoff` are filled in by
/// the retry components when the fault becomes terminal.
#[derive(Debug, Clone)]
pub struct Fault {
    kind: FaultKind,
    status: Option<StatusCode>,
    os_error: Option<i32>,
    detail: String,
    attempts: Option<u32>,
    last_backoff: Option<Duration>,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Fault {
    fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            os_error: None,
            detail: detail.into(),
            attempts: None,
            last_backoff: None,
            source: None,
        }
    }

    /// A fault derived from a delivered HTTP status code.
    pub fn status(status: StatusCode) -> Self {
        let mut fault = Self::new(FaultKind::StatusCode, format!("HTTP status {}", status));
        fault.status = Some(status);
        fault
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, detail)
    }

    pub fn socket(os_error: Option<i32>, detail: impl Into<String>) -> Self {
        let mut fault = Self::new(FaultKind::Socket, detail);
        fault.os_error = os_error;
        fault
    }

    pub fn io(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Io, detail)
    }

    pub fn authorization(status: StatusCode, detail: impl Into<String>) -> Self {
        let mut fault = Self::new(FaultKind::Authorization, detail);
        fault.status = Some(status);
        fault
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Cancelled, detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Configuration, detail)
    }

    pub fn generic(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Generic, detail)
    }

    /// Attach an embedded status code to a fault of any kind.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the underlying error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Decorate the fault with terminal retry diagnostics.
    ///
    /// The fault itself is unchanged in kind, status, and detail; only the
    /// diagnostic fields are filled in.
    pub fn with_retry_diagnostics(mut self, attempts: u32, last_backoff: Option<Duration>) -> Self {
        self.attempts = Some(attempts);
        self.last_backoff = last_backoff;
        self
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn os_error(&self) -> Option<i32> {
        self.os_error
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Total attempts made before the fault became terminal, if decorated.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// The last backoff wait before the fault became terminal, if any.
    pub fn last_backoff(&self) -> Option<Duration> {
        self.last_backoff
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FaultKind::Timeout)
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self.kind, FaultKind::Authorization)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, FaultKind::Cancelled)
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.kind, FaultKind::Configuration)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)?;
        if let (Some(status), FaultKind::Authorization | FaultKind::Socket | FaultKind::Generic) =
            (self.status, self.kind)
        {
            write!(f, " (status {})", status.as_u16())?;
        }
        if let Some(code) = self.os_error {
            write!(f, " (os error {})", code)?;
        }
        if let Some(attempts) = self.attempts {
            write!(f, " [attempts={}", attempts)?;
            if let Some(backoff) = self.last_backoff {
                write!(f, ", last backoff {}ms", backoff.as_millis())?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Service-level error raised by generated clients when a response does not
/// have the expected shape.
///
/// This is a generic catch-all wrapper, so the classifier retries it only
/// when the status code it carries is itself retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponseError {
    status: StatusCode,
    message: String,
}

impl ServiceResponseError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServiceResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service response error ({}): {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ServiceResponseError {}
