//! Timeout policy: bounds the wall-clock duration of the inner chain.
//!
//! The timer races the inner chain. On expiry the policy publishes a
//! cancellation record at its own index, cancels the subtree's child scope
//! (waking any suspended inner work and spawned hedge lanes), emits a
//! timeout event, and yields the `Exceeded` sentinel. Exactly one side of
//! the race produces the result; the losing inner future is dropped.
//!
//! A zero limit rejects immediately without invoking the operation.

use crate::error::{CancelCause, ExceededKind, PolicyError};
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Maximum allowed time limit (30 days), guarding accidental `u64::MAX`
/// style configurations while permitting long jobs.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when building a timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutBuildError {
    #[error("time limit {requested:?} exceeds maximum allowed {limit:?}")]
    ExceedsMaximum { requested: Duration, limit: Duration },
}

/// Fails executions that run longer than a configured limit.
#[derive(Debug, Clone)]
pub struct Timeout {
    limit: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl Timeout {
    /// Create a timeout policy. A zero limit is allowed and rejects every
    /// call before the operation runs.
    pub fn new(limit: Duration) -> Result<Self, TimeoutBuildError> {
        if limit > MAX_TIMEOUT {
            return Err(TimeoutBuildError::ExceedsMaximum { requested: limit, limit: MAX_TIMEOUT });
        }
        Ok(Self { limit, sleeper: Arc::new(TokioSleeper) })
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The configured time limit.
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for Timeout
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
        if self.limit.is_zero() {
            exec.emit(PolicyEvent::TimeoutExceeded { limit: self.limit });
            return Err(PolicyError::Exceeded(ExceededKind::Timeout { limit: self.limit }));
        }

        let child = exec.token().child_token();
        let inner = next.scoped(child.clone()).call(&exec);

        tokio::select! {
            result = inner => result,
            _ = self.sleeper.sleep(self.limit) => {
                exec.publish_cancellation(index, CancelCause::TimedOut);
                child.cancel();
                exec.emit(PolicyEvent::TimeoutExceeded { limit: self.limit });
                tracing::warn!(limit = ?self.limit, "timeout exceeded");
                Err(PolicyError::Exceeded(ExceededKind::Timeout { limit: self.limit }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test(start_paused = true)]
    async fn fast_operations_pass_through() {
        let timeout = Timeout::new(Duration::from_millis(100)).unwrap();
        let executor: Executor<u32, TestError> = Executor::builder().push(timeout).build();

        let result = executor.get(|| async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operations_time_out() {
        let timeout = Timeout::new(Duration::from_millis(100)).unwrap();
        let executor: Executor<u32, TestError> = Executor::builder().push(timeout).build();

        let result = executor
            .get(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(5)
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_cancels_the_operations_token() {
        let timeout = Timeout::new(Duration::from_millis(50)).unwrap();
        let executor: Executor<u32, TestError> = Executor::builder().push(timeout).build();
        let op_token = Arc::new(std::sync::Mutex::new(None));
        let slot = op_token.clone();

        let result = executor
            .get_with_execution(move |exec| {
                let slot = slot.clone();
                async move {
                    *slot.lock().unwrap() = Some(exec.token().clone());
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(1)
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        let token = op_token.lock().unwrap().take().expect("operation ran");
        assert!(token.is_cancelled(), "inner scope must be cancelled on expiry");
    }

    #[tokio::test]
    async fn zero_limit_rejects_without_invoking_operation() {
        let timeout = Timeout::new(Duration::ZERO).unwrap();
        let executor: Executor<u32, TestError> = Executor::builder().push(timeout).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .get(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn build_rejects_absurd_limits() {
        let err = Timeout::new(MAX_TIMEOUT + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TimeoutBuildError::ExceedsMaximum { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_event_is_emitted_once() {
        let timeout = Timeout::new(Duration::from_millis(10)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let executor: Executor<u32, TestError> = Executor::builder()
            .push(timeout)
            .subscribe(move |event| {
                if matches!(event, PolicyEvent::TimeoutExceeded { .. }) {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();

        let _ = executor
            .get(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            })
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
