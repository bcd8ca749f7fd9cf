//! Adaptive concurrency limiting driven by round-trip-time gradients.
//!
//! The limiter keeps two exponentially weighted RTT estimators: a fast one
//! tracking recent samples and a slow baseline. Their ratio
//! `gradient = long / short` signals headroom (> 1) or congestion (< 1).
//! At most once per adjust interval the limit moves to
//! `clamp(limit * gradient^smoothing, [min, max])`, and it only expands when
//! in-flight work actually reached the current limit since the last
//! adjustment (proof the limit, not demand, was the bottleneck).
//!
//! Admission grants a permit while `inflight < limit`. Beyond that, callers
//! may queue up to `max_blocked` deep; a queue estimated to cost more than
//! `max_execution_time` (`ceil((blocked + 1) / limit) * long_rtt`) is
//! rejected up front. Every granted permit must be recorded with its
//! outcome so the estimators evolve; dropping a permit unrecorded releases
//! the slot without contributing a sample.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ExceededKind, PolicyError};
use crate::events::PolicyEvent;
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const SHORT_RTT_ALPHA: f64 = 0.5;
const LONG_RTT_ALPHA: f64 = 0.05;
const MIN_GRADIENT: f64 = 0.5;
const MAX_GRADIENT: f64 = 1.5;

/// Errors returned when building an adaptive limiter.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum AdaptiveBuildError {
    #[error("limit bounds are invalid (min {min}, max {max})")]
    InvalidLimits { min: usize, max: usize },
    #[error("smoothing must be within (0, 1] (got {0})")]
    InvalidSmoothing(f64),
}

/// Errors from standalone permit acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdaptiveLimitError {
    #[error("concurrency limit exceeded")]
    Exceeded,
    #[error("wait for a concurrency permit was cancelled")]
    Canceled,
}

/// Point-in-time load view, consumed by the prioritizer's calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSnapshot {
    /// Callers queued behind the limit.
    pub blocked: usize,
    /// Current concurrency limit.
    pub limit: usize,
    /// `long_rtt / short_rtt`; below 1.0 means congestion.
    pub gradient: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ewma {
    alpha: f64,
    value_millis: f64,
    samples: u64,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Self { alpha, value_millis: 0.0, samples: 0 }
    }

    fn record(&mut self, millis: f64) {
        if self.samples == 0 {
            self.value_millis = millis;
        } else {
            self.value_millis += self.alpha * (millis - self.value_millis);
        }
        self.samples += 1;
    }
}

struct AdaptiveCore {
    limit: f64,
    inflight: usize,
    blocked: usize,
    short_rtt: Ewma,
    long_rtt: Ewma,
    last_adjust_millis: u64,
    limit_hit_since_adjust: bool,
}

impl AdaptiveCore {
    fn gradient(&self) -> f64 {
        if self.short_rtt.samples == 0 || self.long_rtt.samples == 0
            || self.short_rtt.value_millis <= 0.0
        {
            return 1.0;
        }
        (self.long_rtt.value_millis / self.short_rtt.value_millis)
            .clamp(MIN_GRADIENT, MAX_GRADIENT)
    }

    fn limit_floor(&self) -> usize {
        self.limit as usize
    }
}

struct AdaptiveConfig {
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    adjust_interval: Duration,
    max_blocked: usize,
    max_execution_time: Option<Duration>,
}

/// A permit for one in-flight execution. Record it with
/// [`AdaptiveLimiter::record`]; dropping it unrecorded frees the slot
/// without feeding the estimators.
pub struct AdaptivePermit {
    limiter: AdaptiveLimiter,
    acquired_at_millis: u64,
    recorded: bool,
}

impl std::fmt::Debug for AdaptivePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptivePermit")
            .field("acquired_at_millis", &self.acquired_at_millis)
            .finish()
    }
}

impl Drop for AdaptivePermit {
    fn drop(&mut self) {
        if !self.recorded {
            self.limiter.release_unrecorded();
        }
    }
}

/// Gradient-driven concurrency limiter; clone-shares its state.
pub struct AdaptiveLimiter {
    core: Arc<Mutex<AdaptiveCore>>,
    config: Arc<AdaptiveConfig>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl Clone for AdaptiveLimiter {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            config: Arc::clone(&self.config),
            notify: Arc::clone(&self.notify),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("limit", &self.limit())
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl AdaptiveLimiter {
    pub fn builder() -> AdaptiveLimiterBuilder {
        AdaptiveLimiterBuilder::new()
    }

    /// Current concurrency limit.
    pub fn limit(&self) -> usize {
        self.core.lock().expect("adaptive lock").limit_floor()
    }

    /// Executions currently holding a permit.
    pub fn inflight(&self) -> usize {
        self.core.lock().expect("adaptive lock").inflight
    }

    /// Callers queued behind the limit.
    pub fn blocked(&self) -> usize {
        self.core.lock().expect("adaptive lock").blocked
    }

    /// Load view for prioritizer calibration.
    pub fn load(&self) -> LoadSnapshot {
        let core = self.core.lock().expect("adaptive lock");
        LoadSnapshot {
            blocked: core.blocked,
            limit: core.limit_floor().max(1),
            gradient: core.gradient(),
        }
    }

    /// Non-blocking admission.
    pub fn try_acquire_permit(&self) -> Result<AdaptivePermit, AdaptiveLimitError> {
        let mut core = self.core.lock().expect("adaptive lock");
        if core.inflight < core.limit_floor() {
            self.grant(&mut core)
        } else {
            Err(AdaptiveLimitError::Exceeded)
        }
    }

    /// Admission with bounded queueing, aborting early if `cancel` fires.
    pub async fn acquire_permit(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<AdaptivePermit, AdaptiveLimitError> {
        loop {
            let notified = {
                let mut core = self.core.lock().expect("adaptive lock");
                if core.inflight < core.limit_floor() {
                    return self.grant(&mut core);
                }
                if core.blocked >= self.config.max_blocked {
                    return Err(AdaptiveLimitError::Exceeded);
                }
                if let Some(max_execution_time) = self.config.max_execution_time {
                    let limit = core.limit_floor().max(1) as f64;
                    let queued_rounds = ((core.blocked + 1) as f64 / limit).ceil();
                    let estimated =
                        Duration::from_millis((queued_rounds * core.long_rtt.value_millis) as u64);
                    if estimated > max_execution_time {
                        return Err(AdaptiveLimitError::Exceeded);
                    }
                }
                core.blocked += 1;
                self.notify.notified()
            };

            let interrupted = {
                let cancelled = async {
                    match cancel {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = notified => false,
                    _ = cancelled => true,
                }
            };

            let mut core = self.core.lock().expect("adaptive lock");
            core.blocked = core.blocked.saturating_sub(1);
            if interrupted {
                // Hand the wakeup (if one raced in) to the next waiter.
                drop(core);
                self.notify.notify_one();
                return Err(AdaptiveLimitError::Canceled);
            }
            drop(core);
        }
    }

    fn grant(
        &self,
        core: &mut AdaptiveCore,
    ) -> Result<AdaptivePermit, AdaptiveLimitError> {
        core.inflight += 1;
        if core.inflight >= core.limit_floor() {
            core.limit_hit_since_adjust = true;
        }
        if core.blocked > 0 && core.inflight < core.limit_floor() {
            // Chain the wakeup so concurrent releases are not coalesced into
            // a single stored notification.
            self.notify.notify_one();
        }
        Ok(AdaptivePermit {
            limiter: self.clone(),
            acquired_at_millis: self.clock.now_millis(),
            recorded: false,
        })
    }

    /// Record a finished execution's outcome, feeding the RTT estimators
    /// and releasing the permit's slot.
    pub fn record(&self, permit: AdaptivePermit, success: bool) {
        self.record_inner(permit, success, None);
    }

    fn record_inner(
        &self,
        mut permit: AdaptivePermit,
        success: bool,
        emit: Option<&dyn Fn(PolicyEvent)>,
    ) {
        permit.recorded = true;
        let now = self.clock.now_millis();
        let rtt_millis = now.saturating_sub(permit.acquired_at_millis) as f64;

        let mut core = self.core.lock().expect("adaptive lock");
        core.inflight = core.inflight.saturating_sub(1);
        core.short_rtt.record(rtt_millis);
        core.long_rtt.record(rtt_millis);
        let change = self.maybe_adjust(&mut core, now);
        drop(core);

        if let Some((old_limit, new_limit)) = change {
            tracing::debug!(old_limit, new_limit, "adaptive limit adjusted");
            if let Some(emit) = emit {
                emit(PolicyEvent::LimitChanged { old_limit, new_limit });
            }
        }
        if !success {
            tracing::trace!("adaptive limiter recorded a failure");
        }
        self.notify.notify_one();
    }

    fn release_unrecorded(&self) {
        let mut core = self.core.lock().expect("adaptive lock");
        core.inflight = core.inflight.saturating_sub(1);
        drop(core);
        self.notify.notify_one();
    }

    fn maybe_adjust(&self, core: &mut AdaptiveCore, now: u64) -> Option<(usize, usize)> {
        let interval = self.config.adjust_interval.as_millis() as u64;
        if now.saturating_sub(core.last_adjust_millis) < interval {
            return None;
        }
        if core.short_rtt.samples == 0 || core.long_rtt.samples == 0 {
            return None;
        }
        let old_floor = core.limit_floor();
        let gradient = core.gradient();
        let mut new_limit = core.limit * gradient.powf(self.config.smoothing);
        new_limit =
            new_limit.clamp(self.config.min_limit as f64, self.config.max_limit as f64);
        if new_limit > core.limit && !core.limit_hit_since_adjust {
            // Demand never reached the limit; growing it proves nothing.
            new_limit = core.limit;
        }
        core.limit = new_limit;
        core.last_adjust_millis = now;
        core.limit_hit_since_adjust = false;
        let new_floor = core.limit_floor();
        (new_floor != old_floor).then_some((old_floor, new_floor))
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for AdaptiveLimiter
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
        let permit = match self.acquire_permit(Some(exec.token())).await {
            Ok(permit) => permit,
            Err(AdaptiveLimitError::Exceeded) => {
                tracing::debug!("adaptive limiter rejected call");
                return Err(PolicyError::Exceeded(ExceededKind::ConcurrencyLimit));
            }
            Err(AdaptiveLimitError::Canceled) => return Err(exec.canceled_error()),
        };

        let result = next.call(&exec).await;

        if matches!(result, Err(PolicyError::Canceled(_))) {
            // No meaningful RTT sample for a cancelled try.
            drop(permit);
        } else {
            self.record_inner(permit, result.is_ok(), Some(&|event| exec.emit(event)));
        }
        result
    }
}

/// Builder for [`AdaptiveLimiter`].
#[derive(Debug, Clone)]
pub struct AdaptiveLimiterBuilder {
    initial_limit: usize,
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    adjust_interval: Duration,
    max_blocked: usize,
    max_execution_time: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl AdaptiveLimiterBuilder {
    pub fn new() -> Self {
        Self {
            initial_limit: 20,
            min_limit: 1,
            max_limit: 200,
            smoothing: 0.2,
            adjust_interval: Duration::from_secs(1),
            max_blocked: 100,
            max_execution_time: None,
            clock: None,
        }
    }

    /// Starting concurrency limit (default 20).
    pub fn initial_limit(mut self, limit: usize) -> Self {
        self.initial_limit = limit;
        self
    }

    /// Lower bound on the limit (default 1).
    pub fn min_limit(mut self, limit: usize) -> Self {
        self.min_limit = limit;
        self
    }

    /// Upper bound on the limit (default 200).
    pub fn max_limit(mut self, limit: usize) -> Self {
        self.max_limit = limit;
        self
    }

    /// Exponent applied to the gradient per adjustment, in (0, 1]
    /// (default 0.2). Higher values react faster.
    pub fn smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Minimum interval between limit adjustments (default 1s).
    pub fn adjust_interval(mut self, interval: Duration) -> Self {
        self.adjust_interval = interval;
        self
    }

    /// Maximum callers allowed to queue behind the limit (default 100).
    /// Zero disables queueing entirely.
    pub fn max_blocked(mut self, max: usize) -> Self {
        self.max_blocked = max;
        self
    }

    /// Reject admissions whose estimated queue wait exceeds this bound.
    pub fn max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = Some(max);
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> Result<AdaptiveLimiter, AdaptiveBuildError> {
        if self.min_limit == 0 || self.min_limit > self.max_limit {
            return Err(AdaptiveBuildError::InvalidLimits {
                min: self.min_limit,
                max: self.max_limit,
            });
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(AdaptiveBuildError::InvalidSmoothing(self.smoothing));
        }
        let initial = self.initial_limit.clamp(self.min_limit, self.max_limit);
        Ok(AdaptiveLimiter {
            core: Arc::new(Mutex::new(AdaptiveCore {
                limit: initial as f64,
                inflight: 0,
                blocked: 0,
                short_rtt: Ewma::new(SHORT_RTT_ALPHA),
                long_rtt: Ewma::new(LONG_RTT_ALPHA),
                last_adjust_millis: 0,
                limit_hit_since_adjust: false,
            })),
            config: Arc::new(AdaptiveConfig {
                min_limit: self.min_limit,
                max_limit: self.max_limit,
                smoothing: self.smoothing,
                adjust_interval: self.adjust_interval,
                max_blocked: self.max_blocked,
                max_execution_time: self.max_execution_time,
            }),
            notify: Arc::new(Notify::new()),
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default())),
        })
    }
}

impl Default for AdaptiveLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn grants_up_to_the_limit_then_rejects() {
        let limiter = AdaptiveLimiter::builder().initial_limit(2).build().unwrap();

        let _a = limiter.try_acquire_permit().unwrap();
        let _b = limiter.try_acquire_permit().unwrap();
        assert_eq!(limiter.inflight(), 2);
        assert_eq!(limiter.try_acquire_permit().unwrap_err(), AdaptiveLimitError::Exceeded);
    }

    #[test]
    fn dropping_an_unrecorded_permit_frees_the_slot() {
        let limiter = AdaptiveLimiter::builder().initial_limit(1).build().unwrap();

        let permit = limiter.try_acquire_permit().unwrap();
        drop(permit);
        assert_eq!(limiter.inflight(), 0);
        assert!(limiter.try_acquire_permit().is_ok());
    }

    #[test]
    fn recording_feeds_the_estimators() {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::builder()
            .initial_limit(4)
            .with_clock(clock.clone())
            .build()
            .unwrap();

        let permit = limiter.try_acquire_permit().unwrap();
        clock.advance(40);
        limiter.record(permit, true);

        let load = limiter.load();
        assert_eq!(load.blocked, 0);
        assert!(load.gradient > 0.0);
        assert_eq!(limiter.inflight(), 0);
    }

    #[test]
    fn limit_shrinks_under_rising_latency() {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::builder()
            .initial_limit(50)
            .min_limit(1)
            .max_limit(100)
            .smoothing(1.0)
            .adjust_interval(Duration::from_millis(10))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        // Establish a fast baseline.
        for _ in 0..20 {
            let permit = limiter.try_acquire_permit().unwrap();
            clock.advance(10);
            limiter.record(permit, true);
        }
        let before = limiter.limit();

        // Then latency degrades sharply: short RTT rises above the baseline,
        // the gradient drops below 1, and the limit follows.
        for _ in 0..20 {
            let permit = limiter.try_acquire_permit().unwrap();
            clock.advance(200);
            limiter.record(permit, true);
        }
        assert!(limiter.limit() < before, "limit must shrink under congestion");
    }

    #[test]
    fn limit_only_grows_when_it_was_the_bottleneck() {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::builder()
            .initial_limit(10)
            .max_limit(100)
            .smoothing(1.0)
            .adjust_interval(Duration::from_millis(1))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        // Seed both estimators, then improve latency markedly while demand
        // stays far below the limit: no expansion.
        for _ in 0..5 {
            let permit = limiter.try_acquire_permit().unwrap();
            clock.advance(100);
            limiter.record(permit, true);
        }
        let baseline = limiter.limit();
        for _ in 0..10 {
            let permit = limiter.try_acquire_permit().unwrap();
            clock.advance(10);
            limiter.record(permit, true);
        }
        assert_eq!(limiter.limit(), baseline, "idle headroom must not expand the limit");
    }

    #[tokio::test]
    async fn queued_acquires_wake_on_release() {
        let limiter = AdaptiveLimiter::builder().initial_limit(1).build().unwrap();
        let held = limiter.try_acquire_permit().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_permit(None).await.is_ok() })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.blocked(), 1);

        limiter.record(held, true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn queue_bound_rejects_excess_waiters() {
        let limiter =
            AdaptiveLimiter::builder().initial_limit(1).max_blocked(0).build().unwrap();
        let _held = limiter.try_acquire_permit().unwrap();

        let err = limiter.acquire_permit(None).await.unwrap_err();
        assert_eq!(err, AdaptiveLimitError::Exceeded);
    }

    #[tokio::test]
    async fn estimated_wait_past_the_bound_is_rejected() {
        let clock = ManualClock::new();
        let limiter = AdaptiveLimiter::builder()
            .initial_limit(1)
            .max_execution_time(Duration::from_millis(50))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        // Long RTT baseline of ~200ms makes any queue wait estimate exceed
        // the 50ms execution-time bound.
        let permit = limiter.try_acquire_permit().unwrap();
        clock.advance(200);
        limiter.record(permit, true);

        let _held = limiter.try_acquire_permit().unwrap();
        let err = limiter.acquire_permit(None).await.unwrap_err();
        assert_eq!(err, AdaptiveLimitError::Exceeded);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_queued_acquire() {
        let limiter = AdaptiveLimiter::builder().initial_limit(1).build().unwrap();
        let _held = limiter.try_acquire_permit().unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire_permit(Some(&token)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, AdaptiveLimitError::Canceled);
        assert_eq!(limiter.blocked(), 0);
    }

    #[test]
    fn build_rejects_invalid_configs() {
        assert!(AdaptiveLimiter::builder().min_limit(0).build().is_err());
        assert!(AdaptiveLimiter::builder().min_limit(10).max_limit(5).build().is_err());
        assert!(AdaptiveLimiter::builder().smoothing(0.0).build().is_err());
        assert!(AdaptiveLimiter::builder().smoothing(1.5).build().is_err());
    }
}
