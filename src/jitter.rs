//! Jitter strategies to prevent thundering herd on retry.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter: use the exact backoff delay.
    None,
    /// Multiply the delay by uniform [0.5, 1.0].
    Equal,
}

impl Jitter {
    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG so tests are reproducible.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Equal => {
                if delay.is_zero() {
                    return delay;
                }
                let factor: f64 = rng.random_range(0.5..=1.0);
                delay.mul_f64(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn equal_jitter_stays_between_half_and_full() {
        let delay = Duration::from_millis(1_000);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let jittered = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let delay = Duration::from_millis(1_000);
        let a = Jitter::Equal.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        let b = Jitter::Equal.apply_with_rng(delay, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_delay_passes_through() {
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }
}
