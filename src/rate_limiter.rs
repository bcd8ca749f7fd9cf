//! Rate limiting in two flavors.
//!
//! - **Smooth**: token bucket paced to one permit per interval. An acquire
//!   reserves the next free slot (`next_free = max(now, next_free) +
//!   interval`) and the caller sleeps until its reservation comes due.
//! - **Bursty**: a window counter refilled each period; up to the full
//!   capacity may be admitted at a period boundary.
//!
//! Both expose a non-blocking `try_acquire_permit` and a cancellable
//! `acquire_permit` bounded by the configured `max_wait`. Instances
//! clone-share their pacing state.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ExceededKind, PolicyError};
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors returned when building a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimiterBuildError {
    #[error("rate limiter needs a non-zero execution budget")]
    ZeroBudget,
    #[error("rate limiter needs a non-zero period")]
    ZeroPeriod,
}

/// Errors from standalone permit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded")]
    Exceeded,
    #[error("wait for a rate-limit permit was cancelled")]
    Canceled,
}

#[derive(Debug)]
enum LimiterState {
    Smooth { interval_millis: u64, next_free_millis: u64 },
    Bursty { capacity: u64, available: u64, period_millis: u64, period_start_millis: u64 },
}

/// Rate-limiting policy; build with [`RateLimiter::smooth`] or
/// [`RateLimiter::bursty`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
    max_wait: Option<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimiter {
    /// A smooth limiter admitting `max_executions` per `period`, paced
    /// evenly across the period.
    pub fn smooth(max_executions: u64, period: Duration) -> Result<Self, RateLimiterBuildError> {
        if max_executions == 0 {
            return Err(RateLimiterBuildError::ZeroBudget);
        }
        if period.is_zero() {
            return Err(RateLimiterBuildError::ZeroPeriod);
        }
        let interval_millis = (period.as_millis() as u64 / max_executions).max(1);
        Ok(Self::from_state(LimiterState::Smooth { interval_millis, next_free_millis: 0 }))
    }

    /// A smooth limiter with an explicit pacing interval.
    pub fn smooth_interval(interval: Duration) -> Result<Self, RateLimiterBuildError> {
        if interval.is_zero() {
            return Err(RateLimiterBuildError::ZeroPeriod);
        }
        Ok(Self::from_state(LimiterState::Smooth {
            interval_millis: interval.as_millis().max(1) as u64,
            next_free_millis: 0,
        }))
    }

    /// A bursty limiter admitting up to `max_executions` per `period`, with
    /// the whole budget refilled at each period boundary.
    pub fn bursty(max_executions: u64, period: Duration) -> Result<Self, RateLimiterBuildError> {
        if max_executions == 0 {
            return Err(RateLimiterBuildError::ZeroBudget);
        }
        if period.is_zero() {
            return Err(RateLimiterBuildError::ZeroPeriod);
        }
        Ok(Self::from_state(LimiterState::Bursty {
            capacity: max_executions,
            available: max_executions,
            period_millis: period.as_millis() as u64,
            period_start_millis: 0,
        }))
    }

    fn from_state(state: LimiterState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            max_wait: None,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Allow callers to wait up to `max_wait` for a permit.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Reserve a permit only if one is available right now.
    pub fn try_acquire_permit(&self) -> Result<(), RateLimitError> {
        match self.reserve(Duration::ZERO) {
            Some(wait) if wait.is_zero() => Ok(()),
            _ => Err(RateLimitError::Exceeded),
        }
    }

    /// Acquire a permit, waiting for the reservation to come due. The wait
    /// is bounded by `max_wait` when configured and aborts if `cancel`
    /// fires.
    pub async fn acquire_permit(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RateLimitError> {
        let budget = self.max_wait.unwrap_or(Duration::MAX);
        let wait = match self.reserve(budget) {
            Some(wait) => wait,
            None => return Err(RateLimitError::Exceeded),
        };
        if wait.is_zero() {
            return Ok(());
        }
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.sleeper.sleep(wait) => Ok(()),
            _ = cancelled => Err(RateLimitError::Canceled),
        }
    }

    /// Reserve the next slot if its wait fits `budget`; returns the wait
    /// duration, or `None` when the budget would be exceeded.
    fn reserve(&self, budget: Duration) -> Option<Duration> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().expect("rate limiter lock");
        match *state {
            LimiterState::Smooth { interval_millis, ref mut next_free_millis } => {
                let base = (*next_free_millis).max(now);
                let wait = Duration::from_millis(base - now);
                if wait > budget {
                    return None;
                }
                *next_free_millis = base + interval_millis;
                Some(wait)
            }
            LimiterState::Bursty {
                capacity,
                ref mut available,
                period_millis,
                ref mut period_start_millis,
            } => {
                let elapsed = now.saturating_sub(*period_start_millis);
                if elapsed >= period_millis {
                    let periods = elapsed / period_millis;
                    *period_start_millis += periods * period_millis;
                    *available = capacity;
                }
                if *available > 0 {
                    *available -= 1;
                    return Some(Duration::ZERO);
                }
                // Budget exhausted for this period; reserve from the next
                // boundary onward.
                let wait_millis =
                    (*period_start_millis + period_millis).saturating_sub(now);
                let wait = Duration::from_millis(wait_millis);
                if wait > budget {
                    return None;
                }
                *period_start_millis += period_millis;
                *available = capacity - 1;
                Some(wait)
            }
        }
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for RateLimiter
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    async fn execute(
        &self,
        exec: Execution<E>,
        _index: PolicyIndex,
        next: Chain<T, E>,
    ) -> Result<T, PolicyError<E>> {
        let admitted = if self.max_wait.is_some() {
            self.acquire_permit(Some(exec.token())).await
        } else {
            self.try_acquire_permit()
        };
        match admitted {
            Ok(()) => next.call(&exec).await,
            Err(RateLimitError::Exceeded) => {
                exec.emit(PolicyEvent::RateLimitRejected);
                tracing::debug!("rate limiter rejected call");
                Err(PolicyError::Exceeded(ExceededKind::RateLimit))
            }
            Err(RateLimitError::Canceled) => Err(exec.canceled_error()),
        }
    }
}
