//! Fallback: replace matching failures with a substitute result.

use crate::error::PolicyError;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use async_trait::async_trait;
use std::sync::Arc;

type Predicate<T, E> = Arc<dyn Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync>;
type Handler<T, E> =
    Arc<dyn Fn(&Execution<E>, PolicyError<E>) -> Result<T, PolicyError<E>> + Send + Sync>;

/// Replaces failing results on the way out of the stack. Non-matching
/// results pass through unchanged; cancellations always propagate.
pub struct Fallback<T, E> {
    handler: Handler<T, E>,
    matchers: Arc<[Predicate<T, E>]>,
}

impl<T, E> Clone for Fallback<T, E> {
    fn clone(&self) -> Self {
        Self { handler: Arc::clone(&self.handler), matchers: Arc::clone(&self.matchers) }
    }
}

impl<T, E> std::fmt::Debug for Fallback<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fallback").finish()
    }
}

impl<T, E> Fallback<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Fall back to a fixed value.
    pub fn to_value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::with_fn(move |_exec, _err| Ok(value.clone()))
    }

    /// Fall back through a handler receiving the execution and the failure.
    pub fn with_fn<F>(handler: F) -> Self
    where
        F: Fn(&Execution<E>, PolicyError<E>) -> Result<T, PolicyError<E>> + Send + Sync + 'static,
    {
        Self { handler: Arc::new(handler), matchers: Arc::from(Vec::new()) }
    }

    /// Only fall back on outcomes matching `predicate`.
    pub fn handle_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync + 'static,
    {
        let mut matchers: Vec<Predicate<T, E>> = self.matchers.iter().cloned().collect();
        matchers.push(Arc::new(predicate));
        self.matchers = matchers.into();
        self
    }

    /// Only fall back on errors matching `predicate`.
    pub fn handle_error_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.handle_if(move |result| matches!(result, Err(e) if predicate(e)))
    }

    fn applies(&self, result: &Result<T, PolicyError<E>>) -> bool {
        match result {
            Err(PolicyError::Canceled(_)) => false,
            Err(_) if self.matchers.is_empty() => true,
            _ => self.matchers.iter().any(|p| p(result)),
        }
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for Fallback<T, E>
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
        let result = next.call(&exec).await;
        if self.applies(&result) {
            match result {
                Err(err) => {
                    tracing::debug!("fallback replacing failed result");
                    (self.handler)(&exec, err)
                }
                ok => ok,
            }
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CancelCause, ExceededKind};
    use crate::executor::Executor;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn replaces_failures_with_the_value() {
        let fallback = Fallback::to_value(99);
        let executor: Executor<u32, TestError> = Executor::builder().push(fallback).build();

        let result = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("boom"))) })
            .await;

        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn passes_successes_through() {
        let fallback = Fallback::to_value(99);
        let executor: Executor<u32, TestError> = Executor::builder().push(fallback).build();

        let result = executor.get(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn predicate_limits_what_is_replaced() {
        let fallback = Fallback::to_value(0).handle_error_if(|e| e.is_exceeded());
        let executor: Executor<u32, TestError> = Executor::builder().push(fallback).build();

        let untouched = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("boom"))) })
            .await;
        assert!(untouched.is_err(), "non-matching failure passes through");

        let replaced = executor
            .get(|| async { Err::<u32, _>(PolicyError::Exceeded(ExceededKind::RateLimit)) })
            .await;
        assert_eq!(replaced.unwrap(), 0);
    }

    #[tokio::test]
    async fn handler_sees_the_failure_and_execution() {
        let fallback = Fallback::with_fn(|exec, err| {
            assert!(exec.attempts() >= 1);
            match err {
                PolicyError::Inner(TestError(msg)) => Ok(msg.len() as u32),
                other => Err(other),
            }
        });
        let executor: Executor<u32, TestError> = Executor::builder().push(fallback).build();

        let result = executor
            .get(|| async { Err::<u32, _>(PolicyError::Inner(TestError("four"))) })
            .await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn cancellations_always_propagate() {
        let fallback = Fallback::to_value(1);
        let executor: Executor<u32, TestError> = Executor::builder().push(fallback).build();

        let result = executor
            .get(|| async { Err::<u32, _>(PolicyError::Canceled(CancelCause::Caller)) })
            .await;
        assert!(result.unwrap_err().is_canceled());
    }
}
