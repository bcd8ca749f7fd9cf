//! Bulkhead: bounded-concurrency gate with an optional bounded wait queue.
//!
//! Backed by a fair tokio semaphore, so waiters are admitted FIFO. Permits
//! are RAII guards; every terminal path releases its permit when the guard
//! drops. A capacity of zero rejects every acquire.

use crate::error::PolicyError;
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors from standalone permit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadError {
    #[error("bulkhead full ({in_flight} in-flight, max {max})")]
    Full { in_flight: usize, max: usize },
    #[error("wait for a bulkhead permit was cancelled")]
    Canceled,
}

/// A held concurrency slot; dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency-limiting policy; clone-shares its slots.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    max_wait: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
}

impl Bulkhead {
    /// A bulkhead admitting at most `capacity` concurrent executions.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_wait: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Allow callers to wait up to `max_wait` for a slot instead of failing
    /// immediately.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
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

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Executions currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    fn full_error(&self) -> BulkheadError {
        BulkheadError::Full { in_flight: self.in_flight(), max: self.capacity }
    }

    /// Non-blocking acquisition.
    pub fn try_acquire_permit(&self) -> Result<BulkheadPermit, BulkheadError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(_) => Err(self.full_error()),
        }
    }

    /// Wait up to the configured `max_wait` (or indefinitely when none is
    /// set) for a slot, aborting early if `cancel` fires.
    pub async fn acquire_permit(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit, BulkheadError> {
        if self.capacity == 0 {
            return Err(self.full_error());
        }
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.max_wait {
                Some(wait) => self.sleeper.sleep(wait).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            acquired = Arc::clone(&self.semaphore).acquire_owned() => match acquired {
                Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
                Err(_) => Err(self.full_error()),
            },
            _ = deadline => Err(self.full_error()),
            _ = cancelled => Err(BulkheadError::Canceled),
        }
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for Bulkhead
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
        let acquired = if self.max_wait.is_some() {
            self.acquire_permit(Some(exec.token())).await
        } else {
            self.try_acquire_permit()
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(BulkheadError::Full { in_flight, max }) => {
                exec.emit(PolicyEvent::BulkheadRejected { in_flight, max });
                tracing::debug!(in_flight, max, "bulkhead rejected call");
                return Err(PolicyError::Full { in_flight, max });
            }
            Err(BulkheadError::Canceled) => return Err(exec.canceled_error()),
        };

        let result = next.call(&exec).await;
        drop(permit);
        result
    }
}
