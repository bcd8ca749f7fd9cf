//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use palisade::prelude::*;
//! ```

pub use crate::{
    AdaptiveLimiter, Backoff, Bulkhead, CancelCause, CircuitBreaker, CircuitState, ExceededKind,
    Execution, ExecutionSummary, Executor, Fallback, HedgePolicy, Jitter, Policy, PolicyError,
    PolicyEvent, PrioritizedLimiter, Prioritizer, Priority, RateLimiter, RetryPolicy, Timeout,
};
