//! Backoff strategies for retry delays

use std::time::Duration;

/// Delay strategy applied between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries
    Constant { delay: Duration },
    /// Exponentially increasing delay: `min(max, base * factor^(attempt-1))`
    Exponential { base: Duration, max: Duration, factor: f64 },
}

impl Backoff {
    /// Create a constant backoff strategy
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    /// Create a doubling exponential backoff capped at `max`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max, factor: 2.0 }
    }

    /// Set the growth factor for exponential backoff. Values below 1.0 are
    /// treated as 1.0 (no growth).
    pub fn with_factor(mut self, factor: f64) -> Self {
        if let Backoff::Exponential { factor: ref mut f, .. } = self {
            *f = factor.max(1.0);
        }
        self
    }

    /// Calculate the delay before the retry following attempt number
    /// `attempt` (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max, factor } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let scaled = base.as_secs_f64() * factor.powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}
