//! Jitter for retry delays, to prevent thundering herds

use rand::Rng;
use std::time::Duration;

/// Randomization applied to a computed retry delay.
///
/// An absolute component shifts the delay by `uniform(-abs, +abs)`; a ratio
/// component in `[0, 1]` scales it by `1 + uniform(-ratio, +ratio)`. Both can
/// be combined; the result is clamped to be non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Jitter {
    absolute: Option<Duration>,
    ratio: Option<f64>,
}

impl Jitter {
    /// No jitter: delays are used exactly as computed.
    pub fn none() -> Self {
        Self::default()
    }

    /// Jitter by an absolute duration: `delay + uniform(-abs, +abs)`.
    pub fn absolute(abs: Duration) -> Self {
        Self { absolute: Some(abs), ratio: None }
    }

    /// Jitter by a relative fraction: `delay * (1 + uniform(-ratio, +ratio))`.
    pub fn ratio(ratio: f64) -> Self {
        Self { absolute: None, ratio: Some(ratio) }
    }

    /// Add an absolute component to this jitter.
    pub fn with_absolute(mut self, abs: Duration) -> Self {
        self.absolute = Some(abs);
        self
    }

    /// Add a relative component to this jitter.
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = Some(ratio);
        self
    }

    /// The configured relative fraction, if any.
    pub(crate) fn ratio_value(&self) -> Option<f64> {
        self.ratio
    }

    /// True when neither component is configured.
    pub fn is_none(&self) -> bool {
        self.absolute.is_none() && self.ratio.is_none()
    }

    /// Apply jitter to a delay using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.is_none() {
            return delay;
        }
        let mut secs = delay.as_secs_f64();

        if let Some(ratio) = self.ratio {
            let r = ratio.clamp(0.0, 1.0);
            if r > 0.0 {
                secs *= 1.0 + rng.random_range(-r..=r);
            }
        }

        if let Some(abs) = self.absolute {
            let a = abs.as_secs_f64();
            if a > 0.0 {
                secs += rng.random_range(-a..=a);
            }
        }

        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}
