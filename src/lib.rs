#![forbid(unsafe_code)]

//! # Palisade
//!
//! Composable fault-tolerance policies for async Rust: retries, timeouts,
//! circuit breakers, bulkheads, rate limiters, adaptive concurrency
//! limiting with priority-aware shedding, hedged requests, and fallbacks.
//!
//! An [`Executor`] wraps a unit of work with an ordered stack of policies
//! (outermost first) and drives each call through them, coordinating
//! classification, cancellation, and admission across the stack. Policy
//! instances are shareable: one breaker or limiter can guard many
//! executors at once.
//!
//! ## Quick start
//!
//! ```rust
//! use palisade::{
//!     Backoff, CircuitBreaker, Executor, Jitter, PolicyError, RetryPolicy, Timeout,
//! };
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, PartialEq, Eq)]
//! struct ServiceError;
//!
//! impl std::fmt::Display for ServiceError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "service error")
//!     }
//! }
//!
//! impl std::error::Error for ServiceError {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PolicyError<ServiceError>> {
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(100), Duration::from_secs(5)))
//!         .jitter(Jitter::ratio(0.25))
//!         .build()
//!         .expect("valid retry policy");
//!     let breaker = CircuitBreaker::builder()
//!         .failure_threshold(5)
//!         .delay(Duration::from_secs(30))
//!         .build()
//!         .expect("valid breaker");
//!     let timeout = Timeout::new(Duration::from_secs(2)).expect("valid timeout");
//!
//!     // Outermost first: retry around the breaker around the timeout.
//!     let executor: Executor<(), ServiceError> = Executor::builder()
//!         .push(retry)
//!         .push(breaker)
//!         .push(timeout)
//!         .build();
//!
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     executor
//!         .get(move || {
//!             let attempts = attempts.clone();
//!             async move {
//!                 if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
//!                     Err(PolicyError::Inner(ServiceError))
//!                 } else {
//!                     Ok(())
//!                 }
//!             }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

mod adaptive;
mod backoff;
mod breaker;
mod bulkhead;
mod clock;
mod error;
mod events;
mod execution;
mod executor;
mod fallback;
mod hedge;
mod jitter;
mod policy;
mod priority;
mod rate_limiter;
mod retry;
mod sleeper;
mod timeout;

// Re-exports
pub use adaptive::{
    AdaptiveBuildError, AdaptiveLimitError, AdaptiveLimiter, AdaptiveLimiterBuilder,
    AdaptivePermit, LoadSnapshot,
};
pub use backoff::Backoff;
pub use breaker::{BreakerBuildError, CircuitBreaker, CircuitBreakerBuilder, CircuitState};
pub use bulkhead::{Bulkhead, BulkheadError, BulkheadPermit};
pub use clock::{Clock, MonotonicClock};
pub use error::{CancelCause, ExceededKind, PolicyError};
pub use events::{EventListeners, ExecutionSummary, PolicyEvent};
pub use execution::{CancelRecord, Execution};
pub use executor::{ExecutionHandle, Executor, ExecutorBuilder};
pub use fallback::Fallback;
pub use hedge::{HedgeBuildError, HedgePolicy, HedgePolicyBuilder};
pub use jitter::Jitter;
pub use policy::{Chain, Policy, PolicyIndex};
pub use priority::{PrioritizedLimiter, Prioritizer, Priority, MAX_LEVEL};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterBuildError};
pub use retry::{RetryBuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{Timeout, TimeoutBuildError, MAX_TIMEOUT};

pub mod prelude;
