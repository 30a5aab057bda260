//! Per-shard circuit breaker.
//!
//! After K failures within window W the breaker opens for a cooldown T;
//! while open, connection attempts are suppressed. A half-open probe
//! allows one attempt: success closes the breaker, failure re-opens it
//! with the cooldown doubled up to a cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::BreakerSettings;

/// Breaker state, exposed for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    window: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,

    state: BreakerState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    current_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            window: Duration::from_secs(settings.window_secs),
            base_cooldown: Duration::from_secs(settings.cooldown_secs),
            max_cooldown: Duration::from_secs(settings.max_cooldown_secs),
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            current_cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a connection attempt is allowed right now. Transitions
    /// Open -> HalfOpen once the cooldown has elapsed; the half-open state
    /// permits exactly one probe.
    pub fn can_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if self.open_until.map(|t| now >= t).unwrap_or(true) {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful connection.
    pub fn record_success(&mut self) {
        self.failures.clear();
        self.state = BreakerState::Closed;
        self.open_until = None;
        self.current_cooldown = self.base_cooldown;
    }

    /// Record a failed connection or client abort.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                // Probe failed: re-open with doubled cooldown.
                self.current_cooldown =
                    std::cmp::min(self.current_cooldown * 2, self.max_cooldown);
                self.open(now);
            }
            BreakerState::Open => {
                // Failures while open only refresh the timer.
                self.open(now);
            }
            BreakerState::Closed => {
                self.failures.push_back(now);
                while let Some(front) = self.failures.front() {
                    if now.duration_since(*front) > self.window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() as u32 >= self.failure_threshold {
                    self.open(now);
                }
            }
        }
    }

    /// Time until the next attempt is allowed, if the breaker is open.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Open => self.open_until.map(|t| t.saturating_duration_since(now)),
            _ => None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + self.current_cooldown);
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            window_secs: 60,
            cooldown_secs: 10,
            max_cooldown_secs: 40,
        }
    }

    #[test]
    fn test_opens_after_threshold_within_window() {
        let mut breaker = CircuitBreaker::new(&settings());
        let t0 = Instant::now();

        breaker.record_failure(t0);
        breaker.record_failure(t0 + Duration::from_secs(1));
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure(t0 + Duration::from_secs(2));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_attempt(t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_failures_outside_window_do_not_open() {
        let mut breaker = CircuitBreaker::new(&settings());
        let t0 = Instant::now();

        breaker.record_failure(t0);
        breaker.record_failure(t0 + Duration::from_secs(1));
        // Third failure lands after the first slid out of the window.
        breaker.record_failure(t0 + Duration::from_secs(90));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_allows_one_probe() {
        let mut breaker = CircuitBreaker::new(&settings());
        let t0 = Instant::now();
        for i in 0..3 {
            breaker.record_failure(t0 + Duration::from_secs(i));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown not yet elapsed.
        assert!(!breaker.can_attempt(t0 + Duration::from_secs(5)));

        // First call after cooldown grants the probe, the second does not.
        let after = t0 + Duration::from_secs(15);
        assert!(breaker.can_attempt(after));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.can_attempt(after));
    }

    #[test]
    fn test_probe_success_closes() {
        let mut breaker = CircuitBreaker::new(&settings());
        let t0 = Instant::now();
        for i in 0..3 {
            breaker.record_failure(t0 + Duration::from_secs(i));
        }
        assert!(breaker.can_attempt(t0 + Duration::from_secs(15)));
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_attempt(t0 + Duration::from_secs(16)));
    }

    #[test]
    fn test_probe_failure_doubles_cooldown_up_to_cap() {
        let mut breaker = CircuitBreaker::new(&settings());
        let mut now = Instant::now();
        for i in 0..3 {
            breaker.record_failure(now + Duration::from_secs(i));
        }

        // First re-open: cooldown 20s.
        now += Duration::from_secs(15);
        assert!(breaker.can_attempt(now));
        breaker.record_failure(now);
        let remaining = breaker.cooldown_remaining(now).unwrap();
        assert_eq!(remaining, Duration::from_secs(20));

        // Second re-open: cooldown 40s (cap).
        now += Duration::from_secs(25);
        assert!(breaker.can_attempt(now));
        breaker.record_failure(now);
        assert_eq!(
            breaker.cooldown_remaining(now).unwrap(),
            Duration::from_secs(40)
        );

        // Third re-open stays at the cap.
        now += Duration::from_secs(45);
        assert!(breaker.can_attempt(now));
        breaker.record_failure(now);
        assert_eq!(
            breaker.cooldown_remaining(now).unwrap(),
            Duration::from_secs(40)
        );
    }
}
