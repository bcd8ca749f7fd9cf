//! The executor: composes a policy stack around an operation and drives
//! calls through it.
//!
//! Policies are installed outermost first; each call builds a fresh
//! [`Execution`], threads a per-call cancellation token (derived from the
//! executor-level token when one is configured), walks the chain, and fires
//! the terminal listeners exactly once with the call's summary.

use crate::error::{CancelCause, PolicyError};
use crate::events::{EventListeners, ExecutionSummary, PolicyEvent};
use crate::execution::Execution;
use crate::policy::{Chain, Operation, Policy};
use crate::priority::Priority;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type SummaryListener = Arc<dyn Fn(&ExecutionSummary) + Send + Sync>;

#[derive(Default)]
struct TerminalListeners {
    done: Vec<SummaryListener>,
    success: Vec<SummaryListener>,
    failure: Vec<SummaryListener>,
}

#[derive(Debug, Clone, Copy)]
enum LevelConfig {
    None,
    Level(u16),
    Priority(Priority),
}

impl LevelConfig {
    /// Priorities materialize to a fresh random level per call, so shedding
    /// spreads evenly inside the band.
    fn resolve(self) -> Option<u16> {
        match self {
            LevelConfig::None => None,
            LevelConfig::Level(level) => Some(level),
            LevelConfig::Priority(priority) => Some(priority.random_level()),
        }
    }
}

/// Drives operations through an ordered policy stack.
///
/// Cheap to clone; clones share the policies, listeners, and any
/// executor-level cancellation token.
pub struct Executor<T, E> {
    policies: Arc<[Arc<dyn Policy<T, E>>]>,
    listeners: EventListeners,
    terminal: Arc<TerminalListeners>,
    token: Option<CancellationToken>,
    level: LevelConfig,
}

impl<T, E> Clone for Executor<T, E> {
    fn clone(&self) -> Self {
        Self {
            policies: Arc::clone(&self.policies),
            listeners: self.listeners.clone(),
            terminal: Arc::clone(&self.terminal),
            token: self.token.clone(),
            level: self.level,
        }
    }
}

impl<T, E> std::fmt::Debug for Executor<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("policies", &self.policies.len()).finish()
    }
}

impl<T, E> Executor<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn builder() -> ExecutorBuilder<T, E> {
        ExecutorBuilder::new()
    }

    /// A copy of this executor whose calls are cancelled when `token` fires.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut this = self.clone();
        this.token = Some(token);
        this
    }

    /// A copy of this executor whose calls carry a fixed level.
    pub fn with_level(&self, level: u16) -> Self {
        let mut this = self.clone();
        this.level = LevelConfig::Level(level);
        this
    }

    /// A copy of this executor whose calls carry a priority, materialized
    /// to a random level inside its band per call.
    pub fn with_priority(&self, priority: Priority) -> Self {
        let mut this = self.clone();
        this.level = LevelConfig::Priority(priority);
        this
    }

    /// Run the operation under the stack, discarding its value.
    pub async fn run<Op, Fut>(&self, operation: Op) -> Result<(), PolicyError<E>>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        self.get(operation).await.map(|_| ())
    }

    /// Run the operation under the stack and return its value.
    pub async fn get<Op, Fut>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        self.get_with_execution(move |_exec| operation()).await
    }

    /// Like [`Executor::run`], passing the execution handle to the
    /// operation.
    pub async fn run_with_execution<Op, Fut>(&self, operation: Op) -> Result<(), PolicyError<E>>
    where
        Op: Fn(Execution<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        self.get_with_execution(operation).await.map(|_| ())
    }

    /// Like [`Executor::get`], passing the execution handle to the
    /// operation so it can inspect attempt counts, the last error, and the
    /// per-attempt cancellation token.
    pub async fn get_with_execution<Op, Fut>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        Op: Fn(Execution<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        let operation: Operation<T, E> = Arc::new(move |exec| {
            let fut: BoxFuture<'static, Result<T, PolicyError<E>>> = Box::pin(operation(exec));
            fut
        });
        let token = self.call_token();
        self.execute_call(token, operation).await
    }

    /// Run the call on a background task, returning a handle that can await
    /// or cancel it.
    pub fn spawn<Op, Fut>(&self, operation: Op) -> ExecutionHandle<T, E>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        self.spawn_with_execution(move |_exec| operation())
    }

    /// Background counterpart of [`Executor::get_with_execution`].
    pub fn spawn_with_execution<Op, Fut>(&self, operation: Op) -> ExecutionHandle<T, E>
    where
        Op: Fn(Execution<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
    {
        let operation: Operation<T, E> = Arc::new(move |exec| {
            let fut: BoxFuture<'static, Result<T, PolicyError<E>>> = Box::pin(operation(exec));
            fut
        });
        let token = self.call_token();
        let this = self.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move { this.execute_call(task_token, operation).await });
        ExecutionHandle { join, token }
    }

    fn call_token(&self) -> CancellationToken {
        match &self.token {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        }
    }

    async fn execute_call(
        &self,
        token: CancellationToken,
        operation: Operation<T, E>,
    ) -> Result<T, PolicyError<E>> {
        let exec =
            Execution::new(token.clone(), self.listeners.clone(), self.level.resolve());
        exec.record_attempt();
        let chain = Chain::new(Arc::clone(&self.policies), operation, token.clone());

        let result = tokio::select! {
            biased;
            result = chain.call(&exec) => result,
            _ = token.cancelled() => {
                exec.publish_cancellation(0, CancelCause::Caller);
                tracing::debug!("call cancelled by caller");
                Err(PolicyError::Canceled(CancelCause::Caller))
            }
        };

        let summary = ExecutionSummary {
            attempts: exec.attempts(),
            executions: exec.executions(),
            elapsed: exec.elapsed(),
            success: result.is_ok(),
        };
        let terminal =
            if summary.success { &self.terminal.success } else { &self.terminal.failure };
        for listener in terminal {
            listener(&summary);
        }
        for listener in &self.terminal.done {
            listener(&summary);
        }
        result
    }
}

/// Handle to a call running on a background task.
#[derive(Debug)]
pub struct ExecutionHandle<T, E> {
    join: tokio::task::JoinHandle<Result<T, PolicyError<E>>>,
    token: CancellationToken,
}

impl<T, E> ExecutionHandle<T, E> {
    /// Cancel the in-flight call; `get` will surface the cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Await the call's result.
    pub async fn get(self) -> Result<T, PolicyError<E>> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                std::panic::resume_unwind(join_err.into_panic())
            }
            Err(_) => Err(PolicyError::Canceled(CancelCause::Caller)),
        }
    }
}

/// Builder for [`Executor`].
pub struct ExecutorBuilder<T, E> {
    policies: Vec<Arc<dyn Policy<T, E>>>,
    listeners: EventListeners,
    terminal: TerminalListeners,
    token: Option<CancellationToken>,
    level: LevelConfig,
}

impl<T, E> ExecutorBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
            listeners: EventListeners::new(),
            terminal: TerminalListeners::default(),
            token: None,
            level: LevelConfig::None,
        }
    }

    /// Install a policy as the next-innermost layer. The first `push` is
    /// the outermost policy.
    pub fn push<P>(mut self, policy: P) -> Self
    where
        P: Policy<T, E> + 'static,
    {
        self.policies.push(Arc::new(policy));
        self
    }

    /// Receive every policy event emitted during calls.
    pub fn subscribe<F>(mut self, listener: F) -> Self
    where
        F: Fn(&PolicyEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Fires exactly once per call, after success/failure listeners.
    pub fn on_done<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ExecutionSummary) + Send + Sync + 'static,
    {
        self.terminal.done.push(Arc::new(listener));
        self
    }

    /// Fires once per call whose outermost result was a success.
    pub fn on_success<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ExecutionSummary) + Send + Sync + 'static,
    {
        self.terminal.success.push(Arc::new(listener));
        self
    }

    /// Fires once per call whose outermost result was a failure.
    pub fn on_failure<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ExecutionSummary) + Send + Sync + 'static,
    {
        self.terminal.failure.push(Arc::new(listener));
        self
    }

    /// Cancel calls when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Carry a fixed level on every call.
    pub fn with_level(mut self, level: u16) -> Self {
        self.level = LevelConfig::Level(level);
        self
    }

    /// Carry a priority on every call, materialized to a random level.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.level = LevelConfig::Priority(priority);
        self
    }

    pub fn build(self) -> Executor<T, E> {
        Executor {
            policies: self.policies.into(),
            listeners: self.listeners,
            terminal: Arc::new(self.terminal),
            token: self.token,
            level: self.level,
        }
    }
}

impl<T, E> Default for ExecutorBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
