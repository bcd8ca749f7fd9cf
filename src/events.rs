//! Structured events emitted by policies during execution.
//!
//! Listeners registered on the executor receive every policy event for a
//! call. Emission is synchronous from the executing task; listeners must not
//! block.

use crate::breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by individual policies while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// A retry has been scheduled after a classified failure.
    RetryScheduled {
        /// The attempt that just failed (1-indexed).
        attempt: usize,
        /// The delay before the next attempt.
        delay: Duration,
    },
    /// A retry policy gave up.
    RetriesExceeded {
        /// Total attempts made.
        attempts: usize,
    },
    /// The circuit breaker changed state.
    BreakerStateChanged { from: CircuitState, to: CircuitState },
    /// A timeout policy fired.
    TimeoutExceeded {
        /// The configured limit.
        limit: Duration,
    },
    /// The bulkhead rejected a call at capacity.
    BulkheadRejected { in_flight: usize, max: usize },
    /// A rate limiter rejected a call past its wait bound.
    RateLimitRejected,
    /// A hedge lane was launched.
    HedgeLaunched {
        /// The lane number (1 = first hedge).
        attempt: usize,
    },
    /// The adaptive limiter adjusted its concurrency limit.
    LimitChanged { old_limit: usize, new_limit: usize },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryScheduled { attempt, delay } => {
                write!(f, "RetryScheduled(#{}, delay={:?})", attempt, delay)
            }
            Self::RetriesExceeded { attempts } => write!(f, "RetriesExceeded({})", attempts),
            Self::BreakerStateChanged { from, to } => {
                write!(f, "BreakerStateChanged({:?} -> {:?})", from, to)
            }
            Self::TimeoutExceeded { limit } => write!(f, "TimeoutExceeded({:?})", limit),
            Self::BulkheadRejected { in_flight, max } => {
                write!(f, "BulkheadRejected({}/{})", in_flight, max)
            }
            Self::RateLimitRejected => write!(f, "RateLimitRejected"),
            Self::HedgeLaunched { attempt } => write!(f, "HedgeLaunched(#{})", attempt),
            Self::LimitChanged { old_limit, new_limit } => {
                write!(f, "LimitChanged({} -> {})", old_limit, new_limit)
            }
        }
    }
}

/// Snapshot handed to terminal listeners when a call finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Tries of the operation, including ones that never reached it.
    pub attempts: usize,
    /// Tries that actually invoked the operation.
    pub executions: usize,
    /// Wall-clock time for the whole call.
    pub elapsed: Duration,
    /// Whether the outermost result was a success.
    pub success: bool,
}

type Listener = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;

/// A collection of policy-event listeners.
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<Listener>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add<F>(&mut self, listener: F)
    where
        F: Fn(&PolicyEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emit an event to every registered listener, in registration order.
    pub fn emit(&self, event: &PolicyEvent) {
        for listener in &self.listeners {
            listener(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners").field("len", &self.listeners.len()).finish()
    }
}
