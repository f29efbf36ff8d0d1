//! Circuit breaker guarding one vendor.
//!
//! Transitions:
//! - CLOSED → OPEN after `failure_threshold` consecutive failures
//! - OPEN → HALF_OPEN in [`CircuitBreaker::tick`] once the recovery interval
//!   has elapsed since the last failure (no background timer)
//! - HALF_OPEN → CLOSED on the next success
//! - HALF_OPEN → OPEN on a failure that keeps the count at or above threshold
//!
//! [`CircuitBreaker::reset`] forces CLOSED from any state.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the recovery interval elapses
    Open,
    /// A bounded number of probe calls decide whether to close again
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probes_admitted: u32,
    last_probe_at: Option<Instant>,
    failure_threshold: u32,
    recovery_time: Duration,
    half_open_probes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_time: Duration, half_open_probes: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probes_admitted: 0,
            last_probe_at: None,
            failure_threshold: failure_threshold.max(1),
            recovery_time,
            half_open_probes: half_open_probes.max(1),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn recovery_time(&self) -> Duration {
        self.recovery_time
    }

    /// Whether an open circuit's recovery interval has run out.
    pub fn recovery_elapsed(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= self.recovery_time,
            None => true,
        }
    }

    /// Time left before an open circuit may probe again.
    pub fn remaining_recovery(&self, now: Instant) -> Duration {
        match self.last_failure {
            Some(at) => self.recovery_time.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Whether half-open probes went out a full recovery interval ago without
    /// any outcome being recorded.
    fn probes_stale(&self, now: Instant) -> bool {
        self.state == CircuitState::HalfOpen
            && self.probes_admitted >= self.half_open_probes
            && self
                .last_probe_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.recovery_time)
    }

    /// Advance time-driven transitions. Returns `true` if the state changed.
    ///
    /// Also re-arms the half-open probe budget when the outstanding probes
    /// never reported back (for example a cancelled call).
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.probes_stale(now) {
            warn!(
                probes = self.probes_admitted,
                "Half-open probes unanswered, re-arming"
            );
            self.probes_admitted = 0;
            self.last_probe_at = None;
        }

        if self.state == CircuitState::Open && self.recovery_elapsed(now) {
            info!(
                failures = self.consecutive_failures,
                "Circuit recovery interval elapsed, probing"
            );
            self.state = CircuitState::HalfOpen;
            self.probes_admitted = 0;
            return true;
        }
        false
    }

    /// Admit a call through the breaker, consuming a probe when half-open.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probes_admitted < self.half_open_probes {
                    self.probes_admitted += 1;
                    self.last_probe_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Side-effect free version of [`try_admit`](Self::try_admit) as of `now`.
    pub fn would_admit(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(now),
            CircuitState::HalfOpen => {
                self.probes_admitted < self.half_open_probes || self.probes_stale(now)
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            info!("Probe succeeded, closing circuit");
            self.state = CircuitState::Closed;
        }
        self.consecutive_failures = 0;
        self.probes_admitted = 0;
        self.last_probe_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);

        if self.state != CircuitState::Open && self.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.failure_threshold,
                recovery_ms = self.recovery_time.as_millis() as u64,
                "Opening circuit"
            );
            self.state = CircuitState::Open;
            self.probes_admitted = 0;
            self.last_probe_at = None;
        }
    }

    /// Operator escape hatch.
    pub fn reset(&mut self) {
        info!(previous = ?self.state, "Circuit manually reset");
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probes_admitted = 0;
        self.last_probe_at = None;
        self.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_secs(30), 1)
    }

    #[test]
    fn test_opens_at_exact_threshold() {
        let now = Instant::now();
        let mut cb = breaker(3);

        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_admit(now));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let now = Instant::now();
        let mut cb = breaker(3);

        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        cb.record_failure(now);

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[test]
    fn test_tick_moves_open_to_half_open_after_recovery() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);

        assert!(!cb.tick(now + Duration::from_secs(29)));
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.tick(now + Duration::from_secs(30)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_bounded_probes() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);
        let probe_at = now + Duration::from_secs(31);
        cb.tick(probe_at);

        assert!(cb.try_admit(probe_at));
        assert!(!cb.try_admit(probe_at));
    }

    #[test]
    fn test_unanswered_probe_is_rearmed_after_recovery() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);

        let probe_at = now + Duration::from_secs(31);
        cb.tick(probe_at);
        assert!(cb.try_admit(probe_at));

        // The probe's outcome never arrives
        let soon = probe_at + Duration::from_secs(29);
        cb.tick(soon);
        assert!(!cb.would_admit(soon));
        assert!(!cb.try_admit(soon));

        let later = probe_at + Duration::from_secs(30);
        assert!(cb.would_admit(later));
        cb.tick(later);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_admit(later));
        assert!(!cb.try_admit(later));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Instant::now();
        let mut cb = breaker(2);
        cb.record_failure(now);
        cb.record_failure(now);
        cb.tick(now + Duration::from_secs(31));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(now + Duration::from_secs(32));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.remaining_recovery(now + Duration::from_secs(32)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_half_open_success_closes() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);
        cb.tick(now + Duration::from_secs(31));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_reset_always_closes() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.try_admit(now));
    }

    #[test]
    fn test_would_admit_has_no_side_effects() {
        let now = Instant::now();
        let mut cb = breaker(1);
        cb.record_failure(now);

        let later = now + Duration::from_secs(31);
        assert!(cb.would_admit(later));
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
