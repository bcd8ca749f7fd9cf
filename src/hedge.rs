//! Hedging: staggered parallel attempts against tail latency.
//!
//! The first lane starts immediately; while no acceptable result has
//! arrived, additional lanes launch every hedge delay, up to `max_hedges`
//! extras. All lanes share the hedge's policy index: the first acceptable
//! result publishes a cancellation record there, the losing lanes' child
//! scopes are cancelled, and their late results are discarded rather than
//! surfacing as independent failures. If every lane completes without an
//! acceptable result, the last completion is returned.
//!
//! Attempts count per launched lane; executions count only lanes that
//! complete normally before the hedge resolves. A lane cancelled mid-flight
//! reached the operation but is never recorded as an execution.

use crate::error::{CancelCause, PolicyError};
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Predicate<T, E> = Arc<dyn Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// Errors returned when building a hedge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HedgeBuildError {
    #[error("a hedge policy needs at least one hedge attempt")]
    NoHedges,
}

/// Hedging policy; build with [`HedgePolicy::builder`].
pub struct HedgePolicy<T, E> {
    delay: Duration,
    max_hedges: usize,
    delay_fn: Option<DelayFn>,
    failures: Arc<[Predicate<T, E>]>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> Clone for HedgePolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            max_hedges: self.max_hedges,
            delay_fn: self.delay_fn.clone(),
            failures: Arc::clone(&self.failures),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<T, E> std::fmt::Debug for HedgePolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HedgePolicy")
            .field("delay", &self.delay)
            .field("max_hedges", &self.max_hedges)
            .finish()
    }
}

impl<T, E> HedgePolicy<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn builder() -> HedgePolicyBuilder<T, E> {
        HedgePolicyBuilder::new()
    }

    /// A result is worth returning unless a failure predicate says to keep
    /// hedging for a better one.
    fn is_acceptable(&self, result: &Result<T, PolicyError<E>>) -> bool {
        if self.failures.is_empty() {
            result.is_ok()
        } else {
            !self.failures.iter().any(|p| p(result))
        }
    }

    fn stagger(&self, lane: usize) -> Duration {
        match &self.delay_fn {
            Some(f) => f(lane),
            None => self.delay,
        }
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for HedgePolicy<T, E>
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
        let total_lanes = self.max_hedges + 1;
        let (tx, mut rx) = mpsc::channel::<(bool, Result<T, PolicyError<E>>)>(total_lanes);
        let mut lane_tokens: Vec<CancellationToken> = Vec::with_capacity(total_lanes);

        let spawn_lane = |tokens: &mut Vec<CancellationToken>| {
            let lane_token = exec.token().child_token();
            // Lanes defer execution counting: a lane cancelled mid-flight
            // reached the operation but must not count as an execution.
            let (lane_exec, invoked) = exec.with_deferred_execution();
            let fut = next.clone().scoped(lane_token.clone()).call(&lane_exec);
            tokens.push(lane_token);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = fut.await;
                let _ = tx.try_send((invoked.load(Ordering::Acquire), result));
            });
        };

        spawn_lane(&mut lane_tokens);
        let mut completed = 0usize;

        let finish = |tokens: &[CancellationToken], result: Result<T, PolicyError<E>>| {
            exec.publish_cancellation(index, CancelCause::HedgeResolved);
            for token in tokens {
                token.cancel();
            }
            result
        };

        loop {
            let launched = lane_tokens.len();
            let received = if launched < total_lanes {
                tokio::select! {
                    received = rx.recv() => received,
                    _ = self.sleeper.sleep(self.stagger(launched)) => {
                        exec.record_attempt();
                        exec.mark_hedged();
                        exec.emit(PolicyEvent::HedgeLaunched { attempt: launched });
                        tracing::debug!(lane = launched, "hedge launched");
                        spawn_lane(&mut lane_tokens);
                        continue;
                    }
                    _ = exec.token().cancelled() => {
                        return finish(&lane_tokens, Err(exec.canceled_error()));
                    }
                }
            } else {
                tokio::select! {
                    received = rx.recv() => received,
                    _ = exec.token().cancelled() => {
                        return finish(&lane_tokens, Err(exec.canceled_error()));
                    }
                }
            };

            // The sender side outlives this loop, so recv only yields lane
            // results.
            let (invoked, result) =
                received.expect("hedge channel closed with lanes in flight");
            completed += 1;

            // Only lanes whose completion is observed here — before the
            // hedge resolves and cancels the rest — count as executions.
            if invoked && !matches!(result, Err(PolicyError::Canceled(_))) {
                exec.commit_execution();
            }

            if self.is_acceptable(&result) {
                return finish(&lane_tokens, result);
            }
            if completed == total_lanes {
                // Everything launched and everything failed.
                return finish(&lane_tokens, result);
            }
            // Otherwise keep waiting: either a lane is still in flight or
            // the stagger timer will launch another.
        }
    }
}

/// Builder for [`HedgePolicy`].
pub struct HedgePolicyBuilder<T, E> {
    delay: Duration,
    max_hedges: usize,
    delay_fn: Option<DelayFn>,
    failures: Vec<Predicate<T, E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T, E> HedgePolicyBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(100),
            max_hedges: 1,
            delay_fn: None,
            failures: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Stagger between lane launches (default 100ms). Zero launches every
    /// lane immediately.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Extra lanes beyond the primary (default 1).
    pub fn max_hedges(mut self, max: usize) -> Self {
        self.max_hedges = max;
        self
    }

    /// Per-lane stagger override; receives the lane number about to launch
    /// (1 = first hedge).
    pub fn delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(f));
        self
    }

    /// Keep hedging past outcomes matching `predicate` instead of returning
    /// them. Once any predicate is registered, non-matching errors are
    /// returned as-is.
    pub fn hedge_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync + 'static,
    {
        self.failures.push(Arc::new(predicate));
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

    pub fn build(self) -> Result<HedgePolicy<T, E>, HedgeBuildError> {
        if self.max_hedges == 0 {
            return Err(HedgeBuildError::NoHedges);
        }
        Ok(HedgePolicy {
            delay: self.delay,
            max_hedges: self.max_hedges,
            delay_fn: self.delay_fn,
            failures: self.failures.into(),
            sleeper: self.sleeper,
        })
    }
}

impl<T, E> Default for HedgePolicyBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
