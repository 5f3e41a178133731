//! Reconnect backoff
//!
//! Exponential delay with jitter: base times two to the failure
//! count, capped, plus or minus a random fraction. The delay is
//! measured from the last attempt, not from when the caller asks.

use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    /// Create a policy; `jitter` is the fraction of the delay the
    /// random spread may add or remove and must be below 1.0
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    /// The deterministic delay for a failure count: base * 2^failures,
    /// capped. Non-decreasing in the failure count.
    pub fn raw_delay(&self, failures: u32) -> Duration {
        let shift = failures.min(32);
        let millis = (self.base.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The jittered delay for a failure count; never negative
    pub fn delay(&self, failures: u32) -> Duration {
        let raw = self.raw_delay(failures);
        if self.jitter == 0.0 {
            return raw;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        let jittered = Duration::from_millis((raw.as_millis() as f64 * factor) as u64);
        trace!("Backoff delay for {} failures: {:?}", failures, jittered);
        jittered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        assert_eq!(backoff.raw_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.raw_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.raw_delay(2), Duration::from_secs(4));
        assert_eq!(backoff.raw_delay(5), Duration::from_secs(32));
        assert_eq!(backoff.raw_delay(6), Duration::from_secs(60));
        assert_eq!(backoff.raw_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn test_raw_delay_non_decreasing() {
        let backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(300), 0.0);
        let mut last = Duration::ZERO;
        for failures in 0..64 {
            let delay = backoff.raw_delay(failures);
            assert!(delay >= last, "delay decreased at {} failures", failures);
            last = delay;
        }
    }

    #[test]
    fn test_huge_failure_count_saturates() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300), 0.0);
        assert_eq!(backoff.raw_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_bounded_and_never_negative() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.25);
        for failures in 0..8 {
            let raw = backoff.raw_delay(failures);
            for _ in 0..100 {
                let jittered = backoff.delay(failures);
                assert!(jittered >= Duration::from_millis((raw.as_millis() as f64 * 0.74) as u64));
                assert!(jittered <= Duration::from_millis((raw.as_millis() as f64 * 1.26) as u64));
            }
        }
    }

    #[test]
    fn test_jitter_clamped_below_one() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 5.0);
        for _ in 0..100 {
            // Even absurd jitter settings cannot produce a negative delay
            let _ = backoff.delay(3);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60), 0.0);
        assert_eq!(backoff.delay(3), Duration::from_secs(16));
    }
}
