//! Failure classification.
//!
//! Every failure that reaches the retry and circuit-breaker layers is tagged with an
//! [`ErrorKind`]. Only `Validation` failures are terminal; the rest are worth another
//! attempt.
//!
//! Status mapping used by [`FetchError::from_status`]:
//! - `2xx`/`3xx`: not an error
//! - `408`, `425`, `429`, `5xx`: `ExternalService` (retryable)
//! - any other `4xx`: `Validation` (the request itself is wrong, retrying will not help)

use reqwest::Method;
use std::fmt;
use std::time::Duration;

/// Coarse failure category driving retry and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection-level failure (DNS, refused, reset, broken body stream).
    Network,
    /// A configured deadline was exceeded.
    Timeout,
    /// The remote answered with an error status.
    ExternalService,
    /// Malformed caller input, or a response that retrying cannot fix.
    Validation,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Validation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExternalService => "external-service",
            ErrorKind::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can report its own [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Map an HTTP status code to a failure kind, `None` for 2xx/3xx.
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        100..=399 => None,
        408 | 425 | 429 => Some(ErrorKind::ExternalService),
        400..=499 => Some(ErrorKind::Validation),
        _ => Some(ErrorKind::ExternalService),
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub url: String,
    pub method: Method,
    pub status: Option<u16>,
    pub timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { url: url.into(), method, status: None, timeout: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        if let Some(status) = self.status {
            write!(f, " status={}", status)?;
        }
        if let Some(timeout) = self.timeout {
            write!(f, " timeout={:?}", timeout)?;
        }
        Ok(())
    }
}

/// A classified request failure.
///
/// Holds only owned, cloneable data so a single failure can be handed to every
/// caller that was waiting on the same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} failure ({context}): {message}")]
pub struct FetchError {
    kind: ErrorKind,
    context: RequestContext,
    message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, context: RequestContext, message: impl Into<String>) -> Self {
        Self { kind, context, message: message.into() }
    }

    pub fn network(context: RequestContext, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, context, message)
    }

    pub fn timeout(context: RequestContext, timeout: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            context.with_timeout(timeout),
            format!("no response within {:?}", timeout),
        )
    }

    pub fn validation(context: RequestContext, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, context, message)
    }

    pub fn external_service(context: RequestContext, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, context, message)
    }

    /// Build the error for a non-success status. Returns `None` for 2xx/3xx.
    pub fn from_status(context: RequestContext, status: u16) -> Option<Self> {
        kind_for_status(status).map(|kind| {
            Self::new(kind, context.with_status(status), format!("remote returned HTTP {}", status))
        })
    }

    /// Classify a transport error raised by `reqwest`.
    pub fn from_reqwest(context: RequestContext, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new(ErrorKind::Timeout, context, format!("request timed out: {}", err));
        }
        if err.is_builder() {
            return Self::validation(context, format!("invalid request: {}", err));
        }
        if let Some(status) = err.status() {
            if let Some(classified) = Self::from_status(context.clone(), status.as_u16()) {
                return classified;
            }
        }
        if err.is_redirect() {
            return Self::external_service(context, format!("redirect policy violated: {}", err));
        }
        Self::network(context, err.to_string())
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn status(&self) -> Option<u16> {
        self.context.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Classify for FetchError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::UnexpectedEof
            | Io::Interrupted => ErrorKind::Network,
            _ => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "https://search.maven.org/solrsearch")
    }

    #[test]
    fn status_mapping() {
        assert_eq!(kind_for_status(200), None);
        assert_eq!(kind_for_status(304), None);
        assert_eq!(kind_for_status(404), Some(ErrorKind::Validation));
        assert_eq!(kind_for_status(400), Some(ErrorKind::Validation));
        assert_eq!(kind_for_status(408), Some(ErrorKind::ExternalService));
        assert_eq!(kind_for_status(429), Some(ErrorKind::ExternalService));
        assert_eq!(kind_for_status(502), Some(ErrorKind::ExternalService));
    }

    #[test]
    fn only_validation_is_terminal() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ExternalService.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
    }

    #[test]
    fn from_status_carries_context() {
        let err = FetchError::from_status(ctx(), 503).expect("503 is an error");
        assert_eq!(err.kind(), ErrorKind::ExternalService);
        assert_eq!(err.status(), Some(503));
        let msg = err.to_string();
        assert!(msg.starts_with("external-service failure"));
        assert!(msg.contains("GET https://search.maven.org/solrsearch status=503"));

        assert!(FetchError::from_status(ctx(), 204).is_none());
    }

    #[test]
    fn timeout_records_deadline() {
        let err = FetchError::timeout(ctx(), Duration::from_secs(30));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.context().timeout, Some(Duration::from_secs(30)));
        assert!(err.is_retryable());
    }

    #[test]
    fn io_errors_classify() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Classify::kind(&refused), ErrorKind::Network);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(Classify::kind(&denied), ErrorKind::Validation);
    }
}
