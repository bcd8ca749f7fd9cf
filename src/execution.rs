//! Per-call execution state.
//!
//! Every call through an [`crate::executor::Executor`] gets a fresh
//! [`Execution`]: attempt/execution counters, timing, the last recorded
//! failure, and the cancellation plumbing shared by every policy in the
//! stack. Handles are cheap to clone; all clones observe the same state.
//!
//! Cancellation has two halves that always move together:
//! - a `CancellationToken` tree (caller token -> per-call token -> per-policy
//!   child scopes) that wakes suspended work, and
//! - a ladder of [`CancelRecord`]s keyed by policy index, so inner layers
//!   know *who* cancelled them and outer layers are unaffected.

use crate::error::{CancelCause, PolicyError};
use crate::events::{EventListeners, PolicyEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A cancellation published by the policy at `index`; every layer strictly
/// inside that subtree abandons its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRecord {
    /// Index of the publishing policy (outermost = 0).
    pub index: usize,
    /// Why the subtree was cancelled.
    pub cause: CancelCause,
}

struct ExecState<E> {
    attempts: AtomicUsize,
    executions: AtomicUsize,
    started: Instant,
    attempt_started: Mutex<Instant>,
    last_error: Mutex<Option<Arc<PolicyError<E>>>>,
    ladder: Mutex<Option<CancelRecord>>,
    listeners: EventListeners,
    level: Option<u16>,
    retried: AtomicBool,
    hedged: AtomicBool,
}

/// Handle to the state of one in-flight call.
///
/// The handle passed to the operation (and to `*_with_execution` callers)
/// carries the cancellation scope of its attempt; `token()` is the signal to
/// select on for cooperative abort of long I/O.
pub struct Execution<E> {
    state: Arc<ExecState<E>>,
    token: CancellationToken,
    /// When set, operation dispatches mark this cell instead of bumping the
    /// shared execution counter; the policy that installed it commits the
    /// count once it observes the attempt complete without cancellation.
    deferred_execution: Option<Arc<AtomicBool>>,
}

impl<E> Clone for Execution<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            token: self.token.clone(),
            deferred_execution: self.deferred_execution.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Execution<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("attempts", &self.attempts())
            .field("executions", &self.executions())
            .field("cancellation", &self.cancellation())
            .finish()
    }
}

impl<E> Execution<E> {
    pub(crate) fn new(
        token: CancellationToken,
        listeners: EventListeners,
        level: Option<u16>,
    ) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(ExecState {
                attempts: AtomicUsize::new(0),
                executions: AtomicUsize::new(0),
                started: now,
                attempt_started: Mutex::new(now),
                last_error: Mutex::new(None),
                ladder: Mutex::new(None),
                listeners,
                level,
                retried: AtomicBool::new(false),
                hedged: AtomicBool::new(false),
            }),
            token,
            deferred_execution: None,
        }
    }

    /// Tries so far, including tries rejected before reaching the operation.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::Acquire)
    }

    /// Tries that actually invoked the operation.
    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::Acquire)
    }

    /// Elapsed time since the call started.
    pub fn elapsed(&self) -> Duration {
        self.state.started.elapsed()
    }

    /// Elapsed time since the current attempt started.
    pub fn attempt_elapsed(&self) -> Duration {
        self.state.attempt_started.lock().expect("attempt_started lock").elapsed()
    }

    /// The failure recorded before the most recent retry, if any.
    pub fn last_error(&self) -> Option<Arc<PolicyError<E>>> {
        self.state.last_error.lock().expect("last_error lock").clone()
    }

    /// True once a retry policy has re-invoked the inner chain.
    pub fn was_retried(&self) -> bool {
        self.state.retried.load(Ordering::Acquire)
    }

    /// True once a hedge policy has launched an extra lane.
    pub fn was_hedged(&self) -> bool {
        self.state.hedged.load(Ordering::Acquire)
    }

    /// The request level for prioritized admission, when configured.
    pub fn level(&self) -> Option<u16> {
        self.state.level
    }

    /// The cancellation token scoped to this attempt. Operations doing long
    /// I/O should select on `token().cancelled()` so timeouts and hedge
    /// resolution can abort them promptly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn record_attempt(&self) {
        self.state.attempts.fetch_add(1, Ordering::AcqRel);
        *self.state.attempt_started.lock().expect("attempt_started lock") = Instant::now();
    }

    /// Called by the chain when a dispatch reaches the operation. Hedge
    /// lanes run with a deferral marker: their count is only committed once
    /// the lane is seen to complete without being cancelled.
    pub(crate) fn record_execution(&self) {
        match &self.deferred_execution {
            Some(cell) => cell.store(true, Ordering::Release),
            None => {
                self.state.executions.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// A handle whose dispatches mark the returned cell instead of counting
    /// immediately; pair with [`Execution::commit_execution`].
    pub(crate) fn with_deferred_execution(&self) -> (Self, Arc<AtomicBool>) {
        let cell = Arc::new(AtomicBool::new(false));
        let mut scoped = self.clone();
        scoped.deferred_execution = Some(Arc::clone(&cell));
        (scoped, cell)
    }

    /// Commit one deferred execution to the shared counter.
    pub(crate) fn commit_execution(&self) {
        self.state.executions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_retried(&self) {
        self.state.retried.store(true, Ordering::Release);
    }

    pub(crate) fn mark_hedged(&self) {
        self.state.hedged.store(true, Ordering::Release);
    }

    pub(crate) fn set_last_error(&self, err: Arc<PolicyError<E>>) {
        *self.state.last_error.lock().expect("last_error lock") = Some(err);
    }

    /// Swap the cancellation scope; used by the chain when a policy derives a
    /// child scope for its subtree.
    pub(crate) fn scoped(&self, token: CancellationToken) -> Self {
        let mut scoped = self.clone();
        scoped.token = token;
        scoped
    }

    /// Publish a cancellation for the subtree dominated by `index`. The
    /// lowest index wins; an outer cancellation is never displaced by an
    /// inner one.
    pub(crate) fn publish_cancellation(&self, index: usize, cause: CancelCause) {
        let mut ladder = self.state.ladder.lock().expect("ladder lock");
        match *ladder {
            Some(existing) if existing.index <= index => {}
            _ => *ladder = Some(CancelRecord { index, cause }),
        }
    }

    /// The current cancellation record, if any.
    pub fn cancellation(&self) -> Option<CancelRecord> {
        *self.state.ladder.lock().expect("ladder lock")
    }

    /// The record governing a layer at `index`: an outer policy's record
    /// (strictly smaller index), or any caller cancellation.
    pub(crate) fn canceled_below(&self, index: usize) -> Option<CancelRecord> {
        self.cancellation()
            .filter(|rec| rec.index < index || rec.cause == CancelCause::Caller)
    }

    /// Drop records published at or inside `index`. A retrying policy calls
    /// this before re-invoking its subtree so a previous attempt's timeout or
    /// hedge resolution does not poison the next attempt. Caller
    /// cancellations are terminal and never cleared.
    pub(crate) fn clear_cancellation_from(&self, index: usize) {
        let mut ladder = self.state.ladder.lock().expect("ladder lock");
        if let Some(rec) = *ladder {
            if rec.index >= index && rec.cause != CancelCause::Caller {
                *ladder = None;
            }
        }
    }

    /// The cause to surface when the current scope's token fired.
    pub(crate) fn cancel_cause(&self) -> CancelCause {
        self.cancellation().map(|rec| rec.cause).unwrap_or(CancelCause::Caller)
    }

    pub(crate) fn canceled_error(&self) -> PolicyError<E> {
        PolicyError::Canceled(self.cancel_cause())
    }

    pub(crate) fn emit(&self, event: PolicyEvent) {
        self.state.listeners.emit(&event);
    }
}
