//! Error types for the policy runtime

use std::fmt;
use std::time::Duration;

/// Which limit produced a [`PolicyError::Exceeded`] rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceededKind {
    /// A timeout policy fired before the inner chain completed.
    Timeout {
        /// The configured time limit.
        limit: Duration,
    },
    /// A rate limiter could not grant a permit within the wait bound.
    RateLimit,
    /// An adaptive concurrency limiter rejected or timed out the admission.
    ConcurrencyLimit,
    /// The prioritizer shed the request before admission.
    Throttled {
        /// The request's level.
        level: u16,
        /// The rejection threshold at the time of the call.
        threshold: u16,
    },
}

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The caller-supplied cancellation token fired.
    Caller,
    /// A timeout policy cancelled its subtree.
    TimedOut,
    /// A hedge policy resolved and cancelled the losing attempts.
    HedgeResolved,
}

/// Unified error type for every policy-guarded call.
///
/// Policy-produced variants are stable sentinels: outer policies classify
/// them like any other failure, and callers match on them directly.
#[derive(Debug)]
pub enum PolicyError<E> {
    /// A time, rate, concurrency, or priority limit was exceeded.
    Exceeded(ExceededKind),
    /// The circuit breaker is open.
    Open {
        /// Time remaining until the breaker will admit a probe.
        remaining_delay: Duration,
    },
    /// The bulkhead rejected the call at capacity.
    Full {
        /// In-flight count observed at rejection.
        in_flight: usize,
        /// Configured capacity.
        max: usize,
    },
    /// A retry policy exhausted its attempts.
    RetriesExceeded {
        /// Total attempts made.
        attempts: usize,
        /// The failure from the final attempt, when one was captured.
        last_error: Option<Box<PolicyError<E>>>,
    },
    /// The execution was cancelled before it produced a result.
    Canceled(CancelCause),
    /// The underlying operation failed.
    Inner(E),
}

impl<E: Clone> Clone for PolicyError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Exceeded(kind) => Self::Exceeded(*kind),
            Self::Open { remaining_delay } => Self::Open { remaining_delay: *remaining_delay },
            Self::Full { in_flight, max } => Self::Full { in_flight: *in_flight, max: *max },
            Self::RetriesExceeded { attempts, last_error } => Self::RetriesExceeded {
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            Self::Canceled(cause) => Self::Canceled(*cause),
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for PolicyError<E> {
    fn eq(&self, other: &Self) -> bool {
        use PolicyError::*;
        match (self, other) {
            (Exceeded(a), Exceeded(b)) => a == b,
            (Open { remaining_delay: a }, Open { remaining_delay: b }) => a == b,
            (Full { in_flight: a1, max: b1 }, Full { in_flight: a2, max: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (
                RetriesExceeded { attempts: a1, last_error: e1 },
                RetriesExceeded { attempts: a2, last_error: e2 },
            ) => a1 == a2 && e1 == e2,
            (Canceled(a), Canceled(b)) => a == b,
            (Inner(a), Inner(b)) => a == b,
            _ => false,
        }
    }
}

impl<E: fmt::Display> fmt::Display for PolicyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exceeded(ExceededKind::Timeout { limit }) => {
                write!(f, "operation exceeded its time limit of {:?}", limit)
            }
            Self::Exceeded(ExceededKind::RateLimit) => {
                write!(f, "rate limit exceeded")
            }
            Self::Exceeded(ExceededKind::ConcurrencyLimit) => {
                write!(f, "concurrency limit exceeded")
            }
            Self::Exceeded(ExceededKind::Throttled { level, threshold }) => {
                write!(f, "request throttled (level {} below threshold {})", level, threshold)
            }
            Self::Open { remaining_delay } => {
                write!(f, "circuit breaker open ({:?} until half-open)", remaining_delay)
            }
            Self::Full { in_flight, max } => {
                write!(f, "bulkhead full ({} in-flight, max {})", in_flight, max)
            }
            Self::RetriesExceeded { attempts, last_error } => match last_error {
                Some(e) => {
                    write!(f, "retries exceeded after {} attempts, last error: {}", attempts, e)
                }
                None => write!(f, "retries exceeded after {} attempts", attempts),
            },
            Self::Canceled(CancelCause::Caller) => write!(f, "execution cancelled by caller"),
            Self::Canceled(CancelCause::TimedOut) => {
                write!(f, "execution cancelled by an enclosing timeout")
            }
            Self::Canceled(CancelCause::HedgeResolved) => {
                write!(f, "execution cancelled: a hedged attempt already resolved")
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PolicyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExceeded { last_error: Some(e), .. } => {
                Some(e.as_ref() as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> PolicyError<E> {
    /// True for any limit rejection: timeout, rate limit, concurrency
    /// limit, or priority throttle.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded(_))
    }

    /// True when a timeout policy produced this error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Exceeded(ExceededKind::Timeout { .. }))
    }

    /// True when the circuit breaker rejected the call.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// True when the bulkhead rejected the call.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    /// True when a retry policy exhausted its attempts.
    pub fn is_retries_exceeded(&self) -> bool {
        matches!(self, Self::RetriesExceeded { .. })
    }

    /// True when the execution was cancelled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// True when this wraps an operation error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the operation error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the operation error if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The failure from the final attempt of an exhausted retry, if captured.
    pub fn last_error(&self) -> Option<&PolicyError<E>> {
        match self {
            Self::RetriesExceeded { last_error, .. } => last_error.as_deref(),
            _ => None,
        }
    }
}
