//! Error types shared by the resilience policies and the network client.
use crate::classify::{Classify, ErrorKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for every layer wrapped around an operation.
///
/// `Inner` carries the operation's own (classified) failure. The other variants
/// describe a decision taken by a policy, so callers and logs can tell
/// "the remote never got a chance" (`CircuitOpen`) from "the remote failed".
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded the overall operation deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker for `resource` rejected the call without running it.
    CircuitOpen { resource: String, failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { resource, failure_count, open_duration } => {
                write!(
                    f,
                    "circuit breaker for '{}' open ({} failures, open for {:?})",
                    resource, failure_count, open_duration
                )
            }
            Self::RetryExhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retry exhausted after {} attempts{}; no recorded failures",
                        attempts, truncated_note
                    ),
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant keeping only the most recent `MAX_RETRY_FAILURES`.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// All recorded failures for `RetryExhausted`.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The most specific underlying failure: the inner error, or the last retry failure.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }

    /// Resource name reported by a circuit-open rejection.
    pub fn circuit_resource(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { resource, .. } => Some(resource.as_str()),
            _ => None,
        }
    }
}

impl<E: Classify> ResilienceError<E> {
    /// Classification of the failure; `None` for a circuit-open rejection.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::CircuitOpen { .. } => None,
            _ => self.last_error().map(Classify::kind),
        }
    }
}
