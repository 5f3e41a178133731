//! Session circuit breaker
//!
//! Observes consecutive connection failures. Once open, attempts are
//! refused until a fixed recovery window elapses, measured from the
//! instant the circuit opened, not the latest failure; then one probe
//! is allowed.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker over consecutive connection failures
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery_window: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_window: Duration) -> Self {
        Self {
            threshold,
            recovery_window,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether an attempt may proceed. While open and inside the
    /// recovery window this returns the remaining wait; after the
    /// window one probe is allowed through.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if let Some(opened) = self.opened_at {
            let elapsed = opened.elapsed();
            if elapsed < self.recovery_window {
                return Err(self.recovery_window - elapsed);
            }
            debug!("Circuit recovery window elapsed, allowing one probe");
        }
        Ok(())
    }

    /// Record a failed attempt. The open timestamp is written exactly
    /// once per open event: failures while already open leave it
    /// untouched; a failed probe after the window is a new open event.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.opened_at {
            Some(opened) if opened.elapsed() >= self.recovery_window => {
                warn!("Circuit probe failed, reopening");
                self.opened_at = Some(Instant::now());
            }
            Some(_) => {}
            None => {
                if self.consecutive_failures >= self.threshold {
                    warn!(
                        "Circuit opened after {} consecutive failures",
                        self.consecutive_failures
                    );
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Record a successful attempt, closing the circuit
    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            debug!("Circuit closed after successful probe");
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Whether the circuit currently refuses attempts
    pub fn is_open(&self) -> bool {
        self.try_acquire().is_err()
    }

    /// The instant the circuit opened, when it is open
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Consecutive failures observed since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_until_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_open_timestamp_written_once() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        let opened = breaker.opened_at().expect("circuit should be open");

        // Failures while already open never rewrite the timestamp
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.opened_at(), Some(opened));
    }

    #[test]
    fn test_probe_allowed_after_window() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_failed_probe_is_new_open_event() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        let first_open = breaker.opened_at().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire().is_ok());

        breaker.record_failure();
        let second_open = breaker.opened_at().unwrap();
        assert!(second_open > first_open);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_closes_and_resets() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.opened_at().is_none());
    }

    #[test]
    fn test_remaining_wait_reported() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        let remaining = breaker.try_acquire().unwrap_err();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }
}
