//! Retry policy: attempt loop with backoff, jitter, and classification.
//!
//! Semantics
//! - `max_attempts` bounds total tries (default 3), so at most
//!   `max_attempts - 1` retries are scheduled.
//! - Abort predicates strictly beat retry classification.
//! - A cancelled execution is terminal: the loop never retries past a caller
//!   cancellation or an enclosing policy's subtree cancellation.
//! - Delay precedence: delay function, then backoff, then no delay. Jitter
//!   applies to whichever delay was chosen.
//! - With `max_duration` set, the loop stops retrying once the call's total
//!   elapsed time passes the bound, and inter-attempt waits are clamped to
//!   the time remaining.

use crate::backoff::Backoff;
use crate::error::PolicyError;
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::jitter::Jitter;
use crate::policy::{Chain, Policy, PolicyIndex};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

type Predicate<T, E> = Arc<dyn Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync>;
type DelayFn<E> = Arc<dyn Fn(&Execution<E>) -> Option<Duration> + Send + Sync>;

/// Errors returned when building a retry policy.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RetryBuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("jitter ratio must be within [0, 1] (got {0})")]
    InvalidJitterRatio(f64),
}

/// Retries classified failures of the inner chain.
pub struct RetryPolicy<T, E> {
    max_attempts: usize,
    backoff: Option<Backoff>,
    jitter: Jitter,
    max_duration: Option<Duration>,
    delay_fn: Option<DelayFn<E>>,
    handlers: Arc<[Predicate<T, E>]>,
    aborts: Arc<[Predicate<T, E>]>,
    return_last_failure: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> Clone for RetryPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            max_duration: self.max_duration,
            delay_fn: self.delay_fn.clone(),
            handlers: Arc::clone(&self.handlers),
            aborts: Arc::clone(&self.aborts),
            return_last_failure: self.return_last_failure,
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<T, E> std::fmt::Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("max_duration", &self.max_duration)
            .field("return_last_failure", &self.return_last_failure)
            .finish()
    }
}

impl<T, E> RetryPolicy<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<T, E> {
        RetryPolicyBuilder::new()
    }

    /// True when any failure handler classifies this outcome as a failure.
    fn is_failure(&self, result: &Result<T, PolicyError<E>>) -> bool {
        if self.handlers.is_empty() {
            result.is_err()
        } else {
            self.handlers.iter().any(|p| p(result))
        }
    }

    fn is_abort(&self, result: &Result<T, PolicyError<E>>) -> bool {
        self.aborts.iter().any(|p| p(result))
    }

    fn delay_before_retry(&self, exec: &Execution<E>, attempt: usize) -> Duration {
        if let Some(delay_fn) = &self.delay_fn {
            if let Some(delay) = delay_fn(exec) {
                return delay;
            }
        }
        self.backoff.as_ref().map(|b| b.delay(attempt)).unwrap_or(Duration::ZERO)
    }

    fn exhausted(&self, exec: &Execution<E>, last: Result<T, PolicyError<E>>) -> Result<T, PolicyError<E>> {
        let attempts = exec.attempts();
        exec.emit(PolicyEvent::RetriesExceeded { attempts });
        tracing::warn!(attempts, "retries exceeded");
        if self.return_last_failure {
            return last;
        }
        Err(PolicyError::RetriesExceeded {
            attempts,
            last_error: last.err().map(Box::new),
        })
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for RetryPolicy<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    async fn execute(
        &self,
        exec: Execution<E>,
        index: PolicyIndex,
        next: Chain<T, E>,
    ) -> Result<T, PolicyError<E>> {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                // A previous attempt's subtree cancellation (timeout, hedge)
                // must not poison this one.
                exec.clear_cancellation_from(index);
                exec.mark_retried();
                exec.record_attempt();
            }

            let result = next.call(&exec).await;

            if self.is_abort(&result) {
                tracing::debug!(attempt, "abort predicate matched");
                return result;
            }
            if matches!(result, Err(PolicyError::Canceled(_))) {
                return result;
            }
            if !self.is_failure(&result) {
                return result;
            }
            if attempt == self.max_attempts {
                return self.exhausted(&exec, result);
            }
            if let Some(max) = self.max_duration {
                if exec.elapsed() >= max {
                    return self.exhausted(&exec, result);
                }
            }

            if let Err(err) = result {
                exec.set_last_error(Arc::new(err));
            }

            let mut delay = self.jitter.apply(self.delay_before_retry(&exec, attempt));
            if let Some(max) = self.max_duration {
                delay = delay.min(max.saturating_sub(exec.elapsed()));
            }

            exec.emit(PolicyEvent::RetryScheduled { attempt, delay });
            tracing::debug!(attempt, ?delay, "retry scheduled");

            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = exec.token().cancelled() => {
                    return Err(exec.canceled_error());
                }
            }
            if let Some(rec) = exec.canceled_below(index) {
                return Err(PolicyError::Canceled(rec.cause));
            }
        }
        unreachable!("retry loop returns from its final attempt")
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<T, E> {
    max_attempts: usize,
    backoff: Option<Backoff>,
    jitter: Jitter,
    max_duration: Option<Duration>,
    delay_fn: Option<DelayFn<E>>,
    handlers: Vec<Predicate<T, E>>,
    aborts: Vec<Predicate<T, E>>,
    return_last_failure: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> RetryPolicyBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: None,
            jitter: Jitter::none(),
            max_duration: None,
            delay_fn: None,
            handlers: Vec::new(),
            aborts: Vec::new(),
            return_last_failure: false,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts, including the first (default 3).
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Fixed delay between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.backoff = Some(Backoff::constant(delay));
        self
    }

    /// Backoff strategy between attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Jitter applied to computed delays.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound on the call's total elapsed time across attempts and waits.
    pub fn max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    /// Per-attempt delay override. Returning `None` falls back to the
    /// configured backoff.
    pub fn delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Execution<E>) -> Option<Duration> + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(f));
        self
    }

    /// Classify outcomes matching `predicate` as retryable failures. Once
    /// any handler is registered, only matching outcomes are retried.
    pub fn handle_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(predicate));
        self
    }

    /// Classify errors matching `predicate` as retryable failures.
    pub fn handle_error_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.handle_if(move |result| matches!(result, Err(e) if predicate(e)))
    }

    /// Classify a specific success value as a retryable failure.
    pub fn handle_result(self, value: T) -> Self
    where
        T: PartialEq + Sync,
    {
        self.handle_if(move |result| matches!(result, Ok(v) if *v == value))
    }

    /// Stop retrying when `predicate` matches, with priority over every
    /// retry classification.
    pub fn abort_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync + 'static,
    {
        self.aborts.push(Arc::new(predicate));
        self
    }

    /// Abort on errors matching `predicate`.
    pub fn abort_error_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.abort_if(move |result| matches!(result, Err(e) if predicate(e)))
    }

    /// Abort when the operation returns this value.
    pub fn abort_on_result(self, value: T) -> Self
    where
        T: PartialEq + Sync,
    {
        self.abort_if(move |result| matches!(result, Ok(v) if *v == value))
    }

    /// On exhaustion, return the final attempt's outcome unchanged instead
    /// of the retries-exceeded sentinel.
    pub fn return_last_failure(mut self) -> Self {
        self.return_last_failure = true;
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<T, E>, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::InvalidMaxAttempts(0));
        }
        if let Some(ratio) = self.jitter.ratio_value() {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(RetryBuildError::InvalidJitterRatio(ratio));
            }
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            max_duration: self.max_duration,
            delay_fn: self.delay_fn,
            handlers: self.handlers.into(),
            aborts: self.aborts.into(),
            return_last_failure: self.return_last_failure,
            sleeper: self.sleeper,
        })
    }
}

impl<T, E> Default for RetryPolicyBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn executor_with(retry: RetryPolicy<u32, TestError>) -> Executor<u32, TestError> {
        Executor::builder().push(retry).build()
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let retry = RetryPolicy::builder().with_sleeper(InstantSleeper).build().unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let retry = RetryPolicy::builder()
            .max_attempts(5)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PolicyError::Inner(TestError("transient".into())))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_the_last_failure() {
        let retry = RetryPolicy::builder()
            .max_attempts(3)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PolicyError::Inner(TestError(format!("attempt {}", n))))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            PolicyError::RetriesExceeded { attempts, last_error } => {
                assert_eq!(attempts, 3);
                let last = last_error.expect("last error captured");
                assert_eq!(last.as_inner(), Some(&TestError("attempt 2".into())));
            }
            e => panic!("expected RetriesExceeded, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn return_last_failure_skips_the_wrapper() {
        let retry = RetryPolicy::builder()
            .max_attempts(2)
            .return_last_failure()
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);

        let result = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("fail".into()))) })
            .await;

        assert_eq!(result.unwrap_err().as_inner(), Some(&TestError("fail".into())));
    }

    #[tokio::test]
    async fn abort_predicate_beats_retry_classification() {
        let retry = RetryPolicy::builder()
            .max_attempts(5)
            .abort_error_if(|e| matches!(e.as_inner(), Some(TestError(msg)) if msg == "fatal"))
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PolicyError::Inner(TestError("fatal".into())))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "abort must stop the loop");
        assert_eq!(result.unwrap_err().as_inner(), Some(&TestError("fatal".into())));
    }

    #[tokio::test]
    async fn handlers_narrow_what_gets_retried() {
        let retry = RetryPolicy::builder()
            .max_attempts(5)
            .handle_error_if(|e| {
                matches!(e.as_inner(), Some(TestError(msg)) if msg.contains("retryable"))
            })
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PolicyError::Inner(TestError("permanent".into())))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "non-matching error is not retried");
    }

    #[tokio::test]
    async fn handle_result_retries_a_success_value() {
        let retry = RetryPolicy::builder()
            .max_attempts(4)
            .handle_result(0)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(if n < 2 { 0 } else { 9 })
                }
            })
            .await;

        assert_eq!(result.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_delays_are_used() {
        let sleeper = TrackingSleeper::new();
        let retry = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::exponential(Duration::from_millis(100), Duration::from_secs(60)))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let executor = executor_with(retry);

        let _ = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("fail".into()))) })
            .await;

        assert_eq!(sleeper.calls(), 3, "sleeps between 4 attempts");
        assert_eq!(sleeper.call_at(0).unwrap(), Duration::from_millis(100));
        assert_eq!(sleeper.call_at(1).unwrap(), Duration::from_millis(200));
        assert_eq!(sleeper.call_at(2).unwrap(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn delay_fn_overrides_backoff() {
        let sleeper = TrackingSleeper::new();
        let retry = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_secs(9)))
            .delay_fn(|_exec| Some(Duration::from_millis(25)))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let executor = executor_with(retry);

        let _ = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("fail".into()))) })
            .await;

        assert_eq!(sleeper.call_at(0).unwrap(), Duration::from_millis(25));
        assert_eq!(sleeper.call_at(1).unwrap(), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn delay_fn_can_inspect_the_previous_failure() {
        // Mirrors a server-driven backoff hint (e.g. Retry-After).
        let sleeper = TrackingSleeper::new();
        let retry = RetryPolicy::builder()
            .max_attempts(2)
            .delay_fn(|exec| {
                exec.last_error();
                Some(Duration::from_secs(1))
            })
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let executor = executor_with(retry);

        let _ = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("throttled".into()))) })
            .await;

        assert_eq!(sleeper.call_at(0).unwrap(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_delay_retries_back_to_back() {
        let sleeper = TrackingSleeper::new();
        let retry = RetryPolicy::builder()
            .max_attempts(3)
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let executor = executor_with(retry);

        let _ = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("fail".into()))) })
            .await;

        assert_eq!(sleeper.calls(), 2);
        assert_eq!(sleeper.call_at(0).unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn canceled_results_are_never_retried() {
        let retry = RetryPolicy::builder()
            .max_attempts(5)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let executor = executor_with(retry);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PolicyError::Canceled(crate::error::CancelCause::Caller))
                }
            })
            .await;

        assert!(result.unwrap_err().is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_rejects_zero_attempts() {
        let err = RetryPolicy::<u32, TestError>::builder().max_attempts(0).build().unwrap_err();
        assert_eq!(err, RetryBuildError::InvalidMaxAttempts(0));
    }

    #[test]
    fn build_rejects_out_of_range_jitter_ratio() {
        let err = RetryPolicy::<u32, TestError>::builder()
            .jitter(Jitter::ratio(1.5))
            .build()
            .unwrap_err();
        assert_eq!(err, RetryBuildError::InvalidJitterRatio(1.5));
    }
}
