//! Priority-aware load shedding for the adaptive limiter.
//!
//! Requests carry either a coarse [`Priority`] (four buckets) or a fine
//! [`Level`] in `0..=499`; each priority owns a 125-level band, and a
//! priority materializes to a uniformly random level inside its band so
//! shedding degrades smoothly instead of dropping a whole class at once.
//!
//! A shared [`Prioritizer`] watches the load of its registered limiters and
//! maintains one global rejection-threshold level: as queues grow or RTT
//! gradients drop, the threshold rises and lower-level requests are rejected
//! before they ever queue. Calibration is driven by the owner (call
//! [`Prioritizer::calibrate`] on a schedule); admission checks are a single
//! atomic read.

use crate::adaptive::{AdaptiveLimiter, LoadSnapshot};
use crate::error::{ExceededKind, PolicyError};
use crate::execution::Execution;
use crate::policy::{Chain, Policy, PolicyIndex};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

/// Levels run from 0 (shed first) to [`MAX_LEVEL`] (shed last).
pub const MAX_LEVEL: u16 = 499;

const LEVELS_PER_PRIORITY: u16 = (MAX_LEVEL + 1) / 4;

/// Coarse request importance, bucketing the level space into four bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Priority {
    /// The band of levels owned by this priority.
    pub fn level_range(self) -> std::ops::RangeInclusive<u16> {
        let base = self.index() * LEVELS_PER_PRIORITY;
        base..=(base + LEVELS_PER_PRIORITY - 1)
    }

    /// A uniformly random level inside this priority's band.
    pub fn random_level(self) -> u16 {
        self.random_level_with_rng(&mut rand::rng())
    }

    /// Random level with a caller-supplied RNG (deterministic tests).
    pub fn random_level_with_rng<R: Rng>(self, rng: &mut R) -> u16 {
        rng.random_range(self.level_range())
    }

    /// The priority owning `level`; levels past [`MAX_LEVEL`] clamp to
    /// [`Priority::VeryHigh`].
    pub fn from_level(level: u16) -> Self {
        match level.min(MAX_LEVEL) / LEVELS_PER_PRIORITY {
            0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }

    fn index(self) -> u16 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::VeryHigh => 3,
        }
    }
}

/// Tracks aggregate limiter load and converts it into a rejection threshold.
///
/// Clone-shares its state; one prioritizer typically coordinates every
/// prioritized limiter in a process.
#[derive(Debug, Clone, Default)]
pub struct Prioritizer {
    inner: Arc<PrioritizerInner>,
}

#[derive(Debug, Default)]
struct PrioritizerInner {
    threshold: AtomicU16,
    sources: Mutex<Vec<AdaptiveLimiter>>,
}

impl Prioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch a limiter's load during calibration.
    pub fn register(&self, limiter: AdaptiveLimiter) {
        self.inner.sources.lock().expect("prioritizer lock").push(limiter);
    }

    /// The current rejection threshold; requests below it are shed.
    pub fn rejection_threshold(&self) -> u16 {
        self.inner.threshold.load(Ordering::Acquire)
    }

    /// Whether a request at `level` passes the current threshold.
    pub fn admits(&self, level: u16) -> bool {
        level >= self.rejection_threshold()
    }

    /// Recompute the threshold from the registered limiters' load. Call on a
    /// schedule matched to the limiters' adjust interval.
    pub fn calibrate(&self) {
        let overload = {
            let sources = self.inner.sources.lock().expect("prioritizer lock");
            sources.iter().map(|s| overload_score(s.load())).fold(0.0f64, f64::max)
        };
        let target = (overload * (MAX_LEVEL + 1) as f64).round() as u16;
        let old = self.inner.threshold.load(Ordering::Acquire);
        // Move halfway toward the target each round: responsive under
        // sustained load, stable across one-off spikes.
        let new = if target > old {
            old + (target - old + 1) / 2
        } else {
            old - (old - target + 1) / 2
        };
        self.inner.threshold.store(new, Ordering::Release);
        if new != old {
            tracing::debug!(old, new, "rejection threshold recalibrated");
        }
    }
}

/// How overloaded a limiter looks, in `[0, 1]`.
fn overload_score(load: LoadSnapshot) -> f64 {
    let queue_ratio = load.blocked as f64 / load.limit.max(1) as f64;
    let congestion = (1.0 - load.gradient).max(0.0);
    queue_ratio.max(congestion).clamp(0.0, 1.0)
}

/// Adaptive limiter with priority-aware shedding in front of admission.
///
/// Requests below the prioritizer's rejection threshold fail fast with the
/// `Exceeded` sentinel; everything else goes through the wrapped limiter's
/// normal admission (and queueing). Executions without a configured level
/// default to a random [`Priority::Medium`] level.
#[derive(Debug, Clone)]
pub struct PrioritizedLimiter {
    limiter: AdaptiveLimiter,
    prioritizer: Prioritizer,
}

impl PrioritizedLimiter {
    pub fn new(limiter: AdaptiveLimiter, prioritizer: Prioritizer) -> Self {
        prioritizer.register(limiter.clone());
        Self { limiter, prioritizer }
    }

    /// The wrapped limiter.
    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<T, E> Policy<T, E> for PrioritizedLimiter
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
        let level = exec.level().unwrap_or_else(|| Priority::Medium.random_level());
        let threshold = self.prioritizer.rejection_threshold();
        if level < threshold {
            tracing::debug!(level, threshold, "request shed by prioritizer");
            return Err(PolicyError::Exceeded(ExceededKind::Throttled { level, threshold }));
        }
        Policy::<T, E>::execute(&self.limiter, exec, index, next).await
    }
}
