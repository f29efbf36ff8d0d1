//! Sliding-window request and response bookkeeping.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Records older than this are pruned on every admission cycle.
pub const RETENTION: Duration = Duration::from_secs(3600);

/// Hard cap on retained response metrics.
const MAX_RESPONSE_METRICS: usize = 1000;

/// Responses considered for the rolling success rate.
const SUCCESS_RATE_SAMPLE: usize = 20;

/// Time window for request counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Trailing 60 seconds
    Minute,
    /// Trailing 3600 seconds
    Hour,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
        }
    }

    /// Classify a time-to-reset into the window it most likely describes.
    pub fn from_reset(reset_in: Duration) -> Option<Self> {
        if reset_in <= TimeWindow::Minute.duration() {
            Some(TimeWindow::Minute)
        } else if reset_in <= TimeWindow::Hour.duration() {
            Some(TimeWindow::Hour)
        } else {
            None
        }
    }
}

/// One completed call as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMetric {
    pub timestamp: Instant,
    pub response_time: Duration,
    pub success: bool,
    pub status_code: Option<u16>,
    pub rate_limited: bool,
    pub retry_after: Option<Duration>,
}

/// Ambient load at the moment the vendor throttled us.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHitRecord {
    pub timestamp: Instant,
    pub retry_after: Option<Duration>,
    pub requests_in_last_minute: usize,
    pub requests_in_last_hour: usize,
}

/// Per-vendor store of request timestamps, response metrics and rate-limit hits.
#[derive(Debug, Default)]
pub struct RequestLedger {
    requests: VecDeque<Instant>,
    responses: VecDeque<ResponseMetric>,
    hits: VecDeque<RateLimitHitRecord>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one admitted request.
    pub fn record_request(&mut self, at: Instant) {
        self.requests.push_back(at);
    }

    /// Record a completed call.
    pub fn record_response(&mut self, metric: ResponseMetric) {
        self.responses.push_back(metric);
        while self.responses.len() > MAX_RESPONSE_METRICS {
            self.responses.pop_front();
        }
    }

    /// Record a rate-limit hit, capturing the current load.
    pub fn record_hit(&mut self, now: Instant, retry_after: Option<Duration>) -> RateLimitHitRecord {
        let record = RateLimitHitRecord {
            timestamp: now,
            retry_after,
            requests_in_last_minute: self.count_in(TimeWindow::Minute, now),
            requests_in_last_hour: self.count_in(TimeWindow::Hour, now),
        };
        self.hits.push_back(record.clone());
        record
    }

    /// Drop everything older than the retention horizon.
    pub fn prune(&mut self, now: Instant) {
        let expired = |at: Instant| now.saturating_duration_since(at) > RETENTION;

        while self.requests.front().is_some_and(|at| expired(*at)) {
            self.requests.pop_front();
        }
        while self.responses.front().is_some_and(|m| expired(m.timestamp)) {
            self.responses.pop_front();
        }
        while self.hits.front().is_some_and(|h| expired(h.timestamp)) {
            self.hits.pop_front();
        }
    }

    /// Requests recorded within the trailing window.
    pub fn count_in(&self, window: TimeWindow, now: Instant) -> usize {
        let span = window.duration();
        self.requests
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) <= span)
            .count()
    }

    /// Rate-limit hits recorded within the trailing span.
    pub fn hits_within(&self, span: Duration, now: Instant) -> Vec<&RateLimitHitRecord> {
        self.hits
            .iter()
            .filter(|h| now.saturating_duration_since(h.timestamp) <= span)
            .collect()
    }

    /// Fraction of the most recent responses that succeeded; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let sample: Vec<_> = self.responses.iter().rev().take(SUCCESS_RATE_SAMPLE).collect();
        if sample.is_empty() {
            return 1.0;
        }
        let successes = sample.iter().filter(|m| m.success).count();
        successes as f64 / sample.len() as f64
    }

    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }
}
