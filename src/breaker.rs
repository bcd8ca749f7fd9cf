//! Circuit breaker: sliding-window failure tallying with a
//! closed/open/half-open state machine.
//!
//! State transitions are serialized under one per-instance lock; readers of
//! derived state (`state()`, `remaining_delay()`, `failure_count()`) observe
//! a consistent snapshot. Instances clone-share their core, so one breaker
//! can guard many executors.
//!
//! Transitions:
//! - Closed -> Open when, over the window, the failure threshold is met and
//!   the minimum-executions floor is satisfied.
//! - Open -> HalfOpen once the open delay elapses (checked at admission).
//! - HalfOpen -> Closed after `success_threshold` successful probes.
//! - HalfOpen -> Open on any probe failure.
//! - Explicit `open`/`close`/`reset` always win.
//!
//! The `Open` sentinel is never produced while the breaker is closed.

use crate::clock::{Clock, MonotonicClock};
use crate::error::PolicyError;
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Predicate<T, E> = Arc<dyn Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync>;
type DelayFn<T, E> = Arc<dyn Fn(&Result<T, PolicyError<E>>) -> Duration + Send + Sync>;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Errors returned when building a circuit breaker.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BreakerBuildError {
    #[error("sliding window size must be > 0")]
    EmptyWindow,
    #[error("failure rate threshold must be within (0, 1] (got {0})")]
    InvalidRate(f64),
    #[error("success threshold must be > 0")]
    InvalidSuccessThreshold,
    #[error("half-open capacity must be > 0")]
    InvalidHalfOpenCapacity,
}

#[derive(Debug, Clone, Copy)]
enum Threshold {
    /// Open once the window holds at least this many failures.
    Count(usize),
    /// Open once `failures / executions >= rate`, provided the window holds
    /// at least `min_executions` outcomes.
    Rate { rate: f64, min_executions: usize },
}

/// Ten buckets per time window keeps expiry granular without tracking every
/// outcome's timestamp.
const TIME_WINDOW_BUCKETS: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start_millis: u64,
    successes: usize,
    failures: usize,
}

#[derive(Debug)]
enum Window {
    /// Ring of the last N outcomes; `true` records a failure.
    Count { outcomes: VecDeque<bool>, size: usize },
    /// Bucketed counts over a rolling duration.
    Time { buckets: VecDeque<Bucket>, duration_millis: u64, bucket_millis: u64 },
}

impl Window {
    fn count(size: usize) -> Self {
        Window::Count { outcomes: VecDeque::with_capacity(size), size }
    }

    fn time(duration: Duration) -> Self {
        let duration_millis = duration.as_millis().max(1) as u64;
        Window::Time {
            buckets: VecDeque::new(),
            duration_millis,
            bucket_millis: (duration_millis / TIME_WINDOW_BUCKETS).max(1),
        }
    }

    fn record(&mut self, now_millis: u64, failure: bool) {
        match self {
            Window::Count { outcomes, size } => {
                if outcomes.len() == *size {
                    outcomes.pop_front();
                }
                outcomes.push_back(failure);
            }
            Window::Time { buckets, duration_millis, bucket_millis } => {
                Self::expire(buckets, now_millis, *duration_millis);
                let needs_bucket = match buckets.back() {
                    Some(b) => now_millis >= b.start_millis + *bucket_millis,
                    None => true,
                };
                if needs_bucket {
                    buckets.push_back(Bucket { start_millis: now_millis, successes: 0, failures: 0 });
                }
                let bucket = buckets.back_mut().expect("bucket just ensured");
                if failure {
                    bucket.failures += 1;
                } else {
                    bucket.successes += 1;
                }
            }
        }
    }

    fn expire(buckets: &mut VecDeque<Bucket>, now_millis: u64, duration_millis: u64) {
        while let Some(front) = buckets.front() {
            if now_millis.saturating_sub(front.start_millis) > duration_millis {
                buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(executions, failures)` currently inside the window.
    fn totals(&mut self, now_millis: u64) -> (usize, usize) {
        match self {
            Window::Count { outcomes, .. } => {
                let failures = outcomes.iter().filter(|f| **f).count();
                (outcomes.len(), failures)
            }
            Window::Time { buckets, duration_millis, .. } => {
                Self::expire(buckets, now_millis, *duration_millis);
                buckets.iter().fold((0, 0), |(execs, fails), b| {
                    (execs + b.successes + b.failures, fails + b.failures)
                })
            }
        }
    }

    fn clear(&mut self) {
        match self {
            Window::Count { outcomes, .. } => outcomes.clear(),
            Window::Time { buckets, .. } => buckets.clear(),
        }
    }
}

#[derive(Debug)]
enum StateInner {
    Closed,
    Open { opened_at_millis: u64, delay: Duration },
    HalfOpen { successes: usize, inflight: usize },
}

struct BreakerCore {
    state: StateInner,
    window: Window,
}

/// Whether a permit was granted in the closed state or as a half-open probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Standard,
    Probe,
}

struct BreakerConfig<T, E> {
    threshold: Threshold,
    success_threshold: usize,
    half_open_capacity: usize,
    delay: Duration,
    delay_fn: Option<DelayFn<T, E>>,
    handlers: Vec<Predicate<T, E>>,
}

/// Circuit breaker policy; build with [`CircuitBreaker::builder`].
pub struct CircuitBreaker<T, E> {
    core: Arc<Mutex<BreakerCore>>,
    config: Arc<BreakerConfig<T, E>>,
    clock: Arc<dyn Clock>,
}

impl<T, E> Clone for CircuitBreaker<T, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T, E> std::fmt::Debug for CircuitBreaker<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("state", &self.state()).finish()
    }
}

impl<T, E> CircuitBreaker<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn builder() -> CircuitBreakerBuilder<T, E> {
        CircuitBreakerBuilder::new()
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitState {
        match self.core.lock().expect("breaker lock").state {
            StateInner::Closed => CircuitState::Closed,
            StateInner::Open { .. } => CircuitState::Open,
            StateInner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Failures currently inside the sliding window.
    pub fn failure_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.core.lock().expect("breaker lock").window.totals(now).1
    }

    /// Time remaining until an open breaker admits a probe; zero otherwise.
    pub fn remaining_delay(&self) -> Duration {
        let core = self.core.lock().expect("breaker lock");
        match core.state {
            StateInner::Open { opened_at_millis, delay } => {
                let elapsed = self.clock.now_millis().saturating_sub(opened_at_millis);
                delay.saturating_sub(Duration::from_millis(elapsed))
            }
            _ => Duration::ZERO,
        }
    }

    /// Force the breaker open with the configured delay.
    pub fn open(&self) {
        let mut core = self.core.lock().expect("breaker lock");
        let from = state_of(&core.state);
        core.state = StateInner::Open {
            opened_at_millis: self.clock.now_millis(),
            delay: self.config.delay,
        };
        drop(core);
        if from != CircuitState::Open {
            tracing::warn!(?from, "circuit breaker forced open");
        }
    }

    /// Force the breaker closed, keeping the recorded window.
    pub fn close(&self) {
        let mut core = self.core.lock().expect("breaker lock");
        let from = state_of(&core.state);
        core.state = StateInner::Closed;
        drop(core);
        if from != CircuitState::Closed {
            tracing::info!(?from, "circuit breaker forced closed");
        }
    }

    /// Close the breaker and clear all recorded outcomes.
    pub fn reset(&self) {
        let mut core = self.core.lock().expect("breaker lock");
        core.state = StateInner::Closed;
        core.window.clear();
        tracing::info!("circuit breaker reset");
    }

    /// Non-blocking admission check; on success the caller must report the
    /// outcome through `record_success`/`record_failure`.
    pub fn try_acquire_permit(&self) -> Result<(), PolicyError<E>> {
        self.acquire(None).map(|_| ())
    }

    /// Record a successful outcome (standalone use, outside an executor).
    pub fn record_success(&self) {
        if let Some((from, to)) = self.record_outcome(PermitKind::Standard, false, None) {
            self.announce(None, from, to);
        }
    }

    /// Record a failed outcome (standalone use, outside an executor).
    pub fn record_failure(&self) {
        if let Some((from, to)) = self.record_outcome(PermitKind::Standard, true, None) {
            self.announce(None, from, to);
        }
    }

    fn is_failure(&self, result: &Result<T, PolicyError<E>>) -> bool {
        if self.config.handlers.is_empty() {
            result.is_err()
        } else {
            self.config.handlers.iter().any(|p| p(result))
        }
    }

    fn delay_for(&self, result: Option<&Result<T, PolicyError<E>>>) -> Duration {
        match (&self.config.delay_fn, result) {
            (Some(f), Some(result)) => f(result),
            _ => self.config.delay,
        }
    }

    fn acquire(&self, exec: Option<&Execution<E>>) -> Result<PermitKind, PolicyError<E>> {
        let now = self.clock.now_millis();
        let mut guard = self.core.lock().expect("breaker lock");
        let core = &mut *guard;
        match core.state {
            StateInner::Closed => Ok(PermitKind::Standard),
            StateInner::Open { opened_at_millis, delay } => {
                let elapsed = now.saturating_sub(opened_at_millis);
                if Duration::from_millis(elapsed) >= delay {
                    core.state = StateInner::HalfOpen { successes: 0, inflight: 1 };
                    drop(guard);
                    self.announce(exec, CircuitState::Open, CircuitState::HalfOpen);
                    Ok(PermitKind::Probe)
                } else {
                    Err(PolicyError::Open {
                        remaining_delay: delay - Duration::from_millis(elapsed),
                    })
                }
            }
            StateInner::HalfOpen { ref mut inflight, .. } => {
                if *inflight < self.config.half_open_capacity {
                    *inflight += 1;
                    Ok(PermitKind::Probe)
                } else {
                    Err(PolicyError::Open { remaining_delay: Duration::ZERO })
                }
            }
        }
    }

    fn record_outcome(
        &self,
        kind: PermitKind,
        failure: bool,
        delay: Option<Duration>,
    ) -> Option<(CircuitState, CircuitState)> {
        let now = self.clock.now_millis();
        let mut guard = self.core.lock().expect("breaker lock");
        let core = &mut *guard;
        let transition = match core.state {
            StateInner::Closed => {
                core.window.record(now, failure);
                if failure && self.threshold_met(&mut core.window, now) {
                    core.state = StateInner::Open {
                        opened_at_millis: now,
                        delay: delay.unwrap_or(self.config.delay),
                    };
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            StateInner::HalfOpen { ref mut successes, ref mut inflight } => {
                if kind == PermitKind::Probe {
                    *inflight = inflight.saturating_sub(1);
                }
                if failure {
                    core.state = StateInner::Open {
                        opened_at_millis: now,
                        delay: delay.unwrap_or(self.config.delay),
                    };
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                } else {
                    *successes += 1;
                    if *successes >= self.config.success_threshold {
                        core.state = StateInner::Closed;
                        core.window.clear();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
            }
            // Outcomes landing after a forced open are stale; drop them.
            StateInner::Open { .. } => None,
        };
        drop(guard);
        transition
    }

    fn release_unrecorded(&self, kind: PermitKind) {
        if kind == PermitKind::Probe {
            let mut core = self.core.lock().expect("breaker lock");
            if let StateInner::HalfOpen { ref mut inflight, .. } = core.state {
                *inflight = inflight.saturating_sub(1);
            }
        }
    }

    fn threshold_met(&self, window: &mut Window, now: u64) -> bool {
        let (executions, failures) = window.totals(now);
        match self.config.threshold {
            Threshold::Count(count) => failures >= count,
            Threshold::Rate { rate, min_executions } => {
                executions >= min_executions
                    && executions > 0
                    && (failures as f64 / executions as f64) >= rate
            }
        }
    }

    fn announce(&self, exec: Option<&Execution<E>>, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => tracing::warn!(?from, "circuit breaker opened"),
            CircuitState::HalfOpen => tracing::info!(?from, "circuit breaker half-open"),
            CircuitState::Closed => tracing::info!(?from, "circuit breaker closed"),
        }
        if let Some(exec) = exec {
            exec.emit(PolicyEvent::BreakerStateChanged { from, to });
        }
    }
}

fn state_of(state: &StateInner) -> CircuitState {
    match state {
        StateInner::Closed => CircuitState::Closed,
        StateInner::Open { .. } => CircuitState::Open,
        StateInner::HalfOpen { .. } => CircuitState::HalfOpen,
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for CircuitBreaker<T, E>
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
        let kind = match self.acquire(Some(&exec)) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::debug!("circuit breaker rejected call");
                return Err(err);
            }
        };

        let result = next.call(&exec).await;

        if matches!(result, Err(PolicyError::Canceled(_))) {
            // A cancelled try says nothing about downstream health.
            self.release_unrecorded(kind);
            return result;
        }

        let failure = self.is_failure(&result);
        let delay = failure.then(|| self.delay_for(Some(&result)));
        if let Some((from, to)) = self.record_outcome(kind, failure, delay) {
            self.announce(Some(&exec), from, to);
        }
        result
    }
}

/// Builder for [`CircuitBreaker`].
pub struct CircuitBreakerBuilder<T, E> {
    threshold: Threshold,
    window: WindowConfig,
    success_threshold: usize,
    half_open_capacity: Option<usize>,
    delay: Duration,
    delay_fn: Option<DelayFn<T, E>>,
    handlers: Vec<Predicate<T, E>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy)]
enum WindowConfig {
    Count(usize),
    Time(Duration),
}

impl<T, E> CircuitBreakerBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            threshold: Threshold::Count(5),
            window: WindowConfig::Count(100),
            success_threshold: 1,
            half_open_capacity: None,
            delay: Duration::from_secs(60),
            delay_fn: None,
            handlers: Vec::new(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Open once this many failures sit in the window (default 5).
    pub fn failure_threshold(mut self, count: usize) -> Self {
        self.threshold = Threshold::Count(count);
        self
    }

    /// Open once the window's failure rate reaches `rate`, evaluated only
    /// after `min_executions` outcomes have been recorded.
    pub fn failure_rate_threshold(mut self, rate: f64, min_executions: usize) -> Self {
        self.threshold = Threshold::Rate { rate, min_executions };
        self
    }

    /// Track the last `size` outcomes (default 100).
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.window = WindowConfig::Count(size);
        self
    }

    /// Track outcomes over a rolling time window instead of a count.
    pub fn time_window(mut self, duration: Duration) -> Self {
        self.window = WindowConfig::Time(duration);
        self
    }

    /// Successful probes required to close from half-open (default 1).
    pub fn success_threshold(mut self, count: usize) -> Self {
        self.success_threshold = count;
        self
    }

    /// In-flight probe cap in half-open (default: the success threshold).
    pub fn half_open_capacity(mut self, capacity: usize) -> Self {
        self.half_open_capacity = Some(capacity);
        self
    }

    /// Delay before an open breaker admits probes (default 60s).
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Compute the open delay from the outcome that opened the breaker.
    pub fn delay_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> Duration + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(f));
        self
    }

    /// Classify outcomes matching `predicate` as failures. Once any handler
    /// is registered, only matching outcomes count against the breaker.
    pub fn handle_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Result<T, PolicyError<E>>) -> bool + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(predicate));
        self
    }

    /// Classify errors matching `predicate` as failures.
    pub fn handle_error_if<F>(self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.handle_if(move |result| matches!(result, Err(e) if predicate(e)))
    }

    /// Classify a specific success value as a failure.
    pub fn handle_result(self, value: T) -> Self
    where
        T: PartialEq + Sync,
    {
        self.handle_if(move |result| matches!(result, Ok(v) if *v == value))
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<CircuitBreaker<T, E>, BreakerBuildError> {
        match self.window {
            WindowConfig::Count(0) => return Err(BreakerBuildError::EmptyWindow),
            WindowConfig::Time(d) if d.is_zero() => return Err(BreakerBuildError::EmptyWindow),
            _ => {}
        }
        if let Threshold::Rate { rate, .. } = self.threshold {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(BreakerBuildError::InvalidRate(rate));
            }
        }
        if self.success_threshold == 0 {
            return Err(BreakerBuildError::InvalidSuccessThreshold);
        }
        let half_open_capacity = self.half_open_capacity.unwrap_or(self.success_threshold);
        if half_open_capacity == 0 {
            return Err(BreakerBuildError::InvalidHalfOpenCapacity);
        }
        let window = match self.window {
            WindowConfig::Count(size) => Window::count(size),
            WindowConfig::Time(duration) => Window::time(duration),
        };
        Ok(CircuitBreaker {
            core: Arc::new(Mutex::new(BreakerCore { state: StateInner::Closed, window })),
            config: Arc::new(BreakerConfig {
                threshold: self.threshold,
                success_threshold: self.success_threshold,
                half_open_capacity,
                delay: self.delay,
                delay_fn: self.delay_fn,
                handlers: self.handlers,
            }),
            clock: self.clock,
        })
    }
}

impl<T, E> Default for CircuitBreakerBuilder<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
