//! Backoff schedule for retry delays.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `delay(i) = min(initial * multiplier^(i-1), max)`.
///
/// A multiplier of 1.0 degenerates to a constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self { initial, multiplier: multiplier.max(1.0), max }
    }

    /// Fixed delay between attempts.
    pub fn constant(delay: Duration) -> Self {
        Self::new(delay, 1.0, delay)
    }

    /// Doubling delay capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::new(initial, 2.0, max)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial.as_secs_f64() * 1_000.0 * factor;
        if !millis.is_finite() {
            return self.max;
        }
        Duration::from_secs_f64((millis / 1_000.0).min(self.max.as_secs_f64()))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(200), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_each_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn custom_multiplier() {
        let backoff = Backoff::new(Duration::from_millis(100), 3.0, Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
    }

    #[test]
    fn caps_at_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn constant_never_grows() {
        let backoff = Backoff::constant(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(250));
    }

    #[test]
    fn huge_attempt_saturates_instead_of_panicking() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(10_000), Duration::from_secs(60));
    }

    #[test]
    fn sub_one_multiplier_is_clamped() {
        let backoff = Backoff::new(Duration::from_millis(100), 0.5, Duration::from_secs(1));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
    }
}
