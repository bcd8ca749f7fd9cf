//! The policy protocol: how policies wrap each other around an operation.
//!
//! An executor holds an ordered stack of policies, outermost first. Each
//! policy sees the rest of the stack as a [`Chain`] continuation it may
//! invoke once (pass-through), repeatedly (retry), in parallel (hedge), or
//! not at all (gate rejection). The innermost link of the chain invokes the
//! user operation and bumps the execution counter.

use crate::error::PolicyError;
use crate::execution::Execution;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Position of a policy in the composed stack; outermost = 0.
pub type PolicyIndex = usize;

pub(crate) type Operation<T, E> =
    Arc<dyn Fn(Execution<E>) -> BoxFuture<'static, Result<T, PolicyError<E>>> + Send + Sync>;

/// A pluggable fault-tolerance policy.
///
/// `execute` is around-advice: pre-checks happen before invoking `next`,
/// classification and result handling after. Policies must be safe to share
/// across concurrent calls; per-call state lives on the [`Execution`].
/// Implementations bound `T: Send + 'static` and `E: Send + Sync + 'static`
/// so the composed chain can cross task boundaries.
#[async_trait]
pub trait Policy<T, E>: Send + Sync {
    async fn execute(
        &self,
        exec: Execution<E>,
        index: PolicyIndex,
        next: Chain<T, E>,
    ) -> Result<T, PolicyError<E>>;
}

/// The continuation a policy invokes to run the rest of the stack.
///
/// Cloneable and `'static`: a retry policy re-invokes its chain across
/// attempts, and a hedge policy hands clones to parallel lanes. `scoped`
/// swaps in a child cancellation scope so a policy can cancel only the
/// subtree it dominates.
pub struct Chain<T, E> {
    policies: Arc<[Arc<dyn Policy<T, E>>]>,
    operation: Operation<T, E>,
    index: usize,
    token: CancellationToken,
}

impl<T, E> Clone for Chain<T, E> {
    fn clone(&self) -> Self {
        Self {
            policies: Arc::clone(&self.policies),
            operation: Arc::clone(&self.operation),
            index: self.index,
            token: self.token.clone(),
        }
    }
}

impl<T, E> Chain<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(
        policies: Arc<[Arc<dyn Policy<T, E>>]>,
        operation: Operation<T, E>,
        token: CancellationToken,
    ) -> Self {
        Self { policies, operation, index: 0, token }
    }

    /// Replace the cancellation scope for this link and everything inside it.
    pub fn scoped(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The cancellation scope this chain runs under.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run the remainder of the stack. The future is `'static`; hedge lanes
    /// spawn it onto background tasks.
    pub fn call(&self, exec: &Execution<E>) -> BoxFuture<'static, Result<T, PolicyError<E>>> {
        let chain = self.clone();
        let exec = exec.scoped(chain.token.clone());
        Box::pin(async move {
            // An outer policy may already have cancelled this subtree; the
            // ladder check makes each layer observe that exactly once, even
            // between suspension points.
            if let Some(rec) = exec.canceled_below(chain.index) {
                return Err(PolicyError::Canceled(rec.cause));
            }
            match chain.policies.get(chain.index) {
                Some(policy) => {
                    let policy = Arc::clone(policy);
                    policy.execute(exec, chain.index, chain.rest()).await
                }
                None => {
                    exec.record_execution();
                    (chain.operation)(exec).await
                }
            }
        })
    }

    fn rest(&self) -> Self {
        let mut rest = self.clone();
        rest.index += 1;
        rest
    }
}
