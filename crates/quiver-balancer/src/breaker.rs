//! Circuit breaker guarding node eligibility
//!
//! closed -> open after `failure_threshold` consecutive failures;
//! open -> half-open lazily once `open_duration` has elapsed;
//! half-open closes on the next success and re-opens on the next
//! failure. The registry feeds request and probe outcomes in.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            failure_threshold: failure_threshold.max(1),
            open_duration,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Eligibility check with the lazy open -> half-open transition.
    pub fn check_eligible(&mut self, now: Instant) -> bool {
        if self.state == BreakerState::Open {
            if let Some(at) = self.next_attempt_at {
                if now >= at {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state != BreakerState::Open
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.next_attempt_at = None;
            }
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            // A stale success while open changes nothing; recovery goes
            // through half-open.
            BreakerState::Open => {}
        }
    }

    /// Returns true when this failure tripped the breaker open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::HalfOpen => {
                self.trip(now);
                true
            }
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.trip(now);
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.next_attempt_at = Some(now + self.open_duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_exactly_the_threshold() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let now = Instant::now();
        for i in 1..=4 {
            assert!(!breaker.record_failure(now), "tripped early at {i}");
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert!(breaker.record_failure(now));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.check_eligible(now));
    }

    #[test]
    fn half_open_after_open_duration_then_closes_on_success() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(100));
        let now = Instant::now();
        breaker.record_failure(now);
        assert!(!breaker.check_eligible(now));

        // Still open just before the deadline.
        assert!(!breaker.check_eligible(now + Duration::from_millis(99)));

        // Lazy transition on the next eligibility check.
        assert!(breaker.check_eligible(now + Duration::from_millis(100)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let now = Instant::now();
        breaker.record_failure(now);
        assert!(breaker.check_eligible(now + Duration::from_millis(10)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.record_failure(now + Duration::from_millis(11)));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
