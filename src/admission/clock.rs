//! Time sources for the limiter.
//!
//! Every time-dependent decision reads the clock through the [`Clock`] trait so
//! circuit recovery, window pruning and burst cooldowns can be driven by
//! simulated time in tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time, used for all window and interval arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock time, used only to interpret epoch-based reset headers.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// System clock backed by `Instant::now()` and `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// Clones share the same time, so a clone handed to a limiter can be advanced
/// from the test body.
///
/// ```
/// use ratewise::admission::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<(Instant, DateTime<Utc>)>>,
}

impl MockClock {
    /// Create a mock clock starting at the current real time.
    pub fn new() -> Self {
        Self::starting_at(Instant::now(), Utc::now())
    }

    /// Create a mock clock starting at specific instants.
    pub fn starting_at(instant: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new((instant, wall))),
        }
    }

    /// Advance both clocks by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        current.0 += duration;
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        current.1 = current.1 + delta;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.current.lock().0
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.current.lock().1
    }
}
