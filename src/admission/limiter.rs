//! Per-vendor admission controller.
//!
//! [`RateLimiter`] owns every piece of mutable state for one vendor: the
//! request ledger, the circuit breaker, the delay calculator, the burst
//! manager and the limits learned from the vendor. It is a plain `&mut self`
//! state machine; serialization across tasks is the job of whoever holds it
//! (see [`VendorRegistry`](super::VendorRegistry)).

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::burst::{BurstDecision, BurstEndReason, BurstManager, BurstOutcome};
use super::circuit::{CircuitBreaker, CircuitState};
use super::classifier::{FailureClassifier, FailureKind, PatternClassifier};
use super::clock::{Clock, SystemClock};
use super::delay::{millis_to_duration, DelayCalculator, DelayContext, DelayDecision, LOAD_THRESHOLD};
use super::headers::{parse_rate_limit_headers, HeaderObservation, ResponseHeaders};
use super::ledger::{RequestLedger, ResponseMetric, TimeWindow, RETENTION};
use super::status::LimiterStatus;
use crate::config::LimiterConfig;
use crate::error::CallError;

/// Trailing span of rate-limit hits used to infer the vendor's ceiling.
const CALIBRATION_SPAN: Duration = Duration::from_secs(300);

/// Hits required within the span before inferring a ceiling.
const CALIBRATION_MIN_HITS: usize = 2;

/// Best estimate of the vendor's real limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectedLimits {
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    /// Largest burst that completed without being throttled
    pub burst_size: Option<u32>,
}

/// Where the effective per-minute limit comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    /// Configured default, nothing learned yet
    Configured,
    /// Conservative guess for a vendor that sends no rate-limit headers
    Assumed,
    /// Inferred from the load at recent rate-limit hits
    Inferred,
    /// Advertised by the vendor's response headers
    Headers,
}

/// Measurements reported with a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMetrics {
    pub response_time: Duration,
    pub status_code: Option<u16>,
}

impl CallMetrics {
    pub fn new(response_time: Duration, status_code: u16) -> Self {
        Self {
            response_time,
            status_code: Some(status_code),
        }
    }
}

#[derive(Debug, Clone)]
struct HeaderState {
    observation: HeaderObservation,
    observed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmitPath {
    Steady,
    ContinueBurst,
    StartBurst(u32),
}

/// Admission controller for one vendor.
pub struct RateLimiter {
    vendor: String,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn FailureClassifier>,
    ledger: RequestLedger,
    /// Admissions whose outcome has not been reported yet
    in_flight: VecDeque<Instant>,
    circuit: CircuitBreaker,
    delay: DelayCalculator,
    burst: BurstManager,
    detected: DetectedLimits,
    minute_source: LimitSource,
    avg_response_ms: Option<f64>,
    last_retry_after: Option<Duration>,
    last_headers: Option<HeaderState>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("vendor", &self.vendor)
            .field("circuit", &self.circuit.state())
            .field("detected", &self.detected)
            .field("base_delay_ms", &self.delay.base_delay_ms())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter with the system clock and the configured failure patterns.
    pub fn new(vendor: impl Into<String>, config: LimiterConfig) -> Self {
        let classifier = Arc::new(PatternClassifier::new(&config.rate_limit_patterns));
        Self {
            vendor: vendor.into(),
            clock: Arc::new(SystemClock::new()),
            classifier,
            ledger: RequestLedger::new(),
            in_flight: VecDeque::new(),
            circuit: CircuitBreaker::new(
                config.failure_threshold,
                config.recovery_time(),
                config.half_open_probes,
            ),
            delay: DelayCalculator::new(&config),
            burst: BurstManager::new(config.burst.clone()),
            detected: DetectedLimits::default(),
            minute_source: LimitSource::Configured,
            avg_response_ms: None,
            last_retry_after: None,
            last_headers: None,
            config,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Swap the failure classifier in place, keeping learned state.
    pub fn set_classifier(&mut self, classifier: Arc<dyn FailureClassifier>) {
        self.classifier = classifier;
    }

    /// Make jitter deterministic.
    pub fn with_delay_seed(mut self, seed: u64) -> Self {
        self.delay = DelayCalculator::with_seed(&self.config, seed);
        self
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.circuit.consecutive_failures()
    }

    pub fn detected_limits(&self) -> DetectedLimits {
        self.detected
    }

    pub fn minute_limit_source(&self) -> LimitSource {
        self.minute_source
    }

    /// Detected per-minute limit if known, else the configured one.
    pub fn effective_minute_limit(&self) -> u32 {
        self.detected
            .requests_per_minute
            .unwrap_or(self.config.requests_per_minute)
    }

    /// Detected per-hour limit if known, else the configured one.
    pub fn effective_hour_limit(&self) -> u32 {
        self.detected
            .requests_per_hour
            .unwrap_or(self.config.requests_per_hour)
    }

    pub fn success_rate(&self) -> f64 {
        self.ledger.success_rate()
    }

    /// Exponentially weighted average latency; zero before the first sample.
    pub fn avg_response_ms(&self) -> f64 {
        self.avg_response_ms.unwrap_or(0.0)
    }

    pub fn base_delay_ms(&self) -> f64 {
        self.delay.base_delay_ms()
    }

    pub fn is_bursting(&self) -> bool {
        self.burst.is_bursting()
    }

    /// Run time-driven transitions: OPEN → HALF_OPEN once the recovery
    /// interval has elapsed, and pruning of records past the one-hour horizon.
    ///
    /// [`can_admit`](Self::can_admit) calls this first; read accessors never do.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.tick_at(now);
    }

    fn tick_at(&mut self, now: Instant) {
        if self.circuit.tick(now) {
            debug!(vendor = %self.vendor, "Circuit half-open");
        }
        self.ledger.prune(now);

        // A reservation whose call was abandoned stops counting after a minute
        let window = TimeWindow::Minute.duration();
        while self
            .in_flight
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.in_flight.pop_front();
        }
    }

    /// Admissions still awaiting an outcome within the minute window.
    fn in_flight_at(&self, now: Instant) -> usize {
        let window = TimeWindow::Minute.duration();
        self.in_flight
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count()
    }

    /// Requests recorded in the minute window plus those still in flight.
    fn minute_load(&self, now: Instant) -> usize {
        self.ledger.count_in(TimeWindow::Minute, now) + self.in_flight_at(now)
    }

    fn release_reservation(&mut self) {
        self.in_flight.pop_front();
    }

    /// Decide whether a request may be sent now.
    ///
    /// An admitted request holds a slot in the window until its outcome is
    /// reported through one of the `record_*` methods. A slot that is never
    /// released lapses after a minute.
    pub fn can_admit(&mut self) -> bool {
        let now = self.clock.now();
        self.tick_at(now);

        // Let an exhausted burst end itself before deciding
        if self.burst.is_bursting() && !self.burst.can_make_burst_request(now) {
            self.learn_from_burst();
        }

        let Some(path) = self.admission_path(now) else {
            trace!(
                vendor = %self.vendor,
                circuit = ?self.circuit.state(),
                minute = self.minute_load(now),
                limit = self.effective_minute_limit(),
                "Request denied"
            );
            return false;
        };

        // Consumes a probe when half-open
        if !self.circuit.try_admit(now) {
            return false;
        }
        self.in_flight.push_back(now);

        match path {
            AdmitPath::Steady => {}
            AdmitPath::ContinueBurst => self.burst.record_burst_request(now),
            AdmitPath::StartBurst(size) => {
                if self.burst.start_burst(now, size) {
                    self.burst.record_burst_request(now);
                }
            }
        }
        self.learn_from_burst();
        true
    }

    /// Side-effect free preview of [`can_admit`](Self::can_admit).
    ///
    /// An OPEN circuit whose recovery interval has elapsed previews as
    /// admissible even though the HALF_OPEN transition has not happened yet.
    pub fn would_admit(&self) -> bool {
        self.admission_path(self.clock.now()).is_some()
    }

    fn admission_path(&self, now: Instant) -> Option<AdmitPath> {
        if !self.circuit.would_admit(now) {
            return None;
        }
        if self.headers_exhausted(now) {
            return None;
        }

        let pending = self.in_flight_at(now);
        let minute = self.ledger.count_in(TimeWindow::Minute, now) + pending;
        let hour = self.ledger.count_in(TimeWindow::Hour, now) + pending;
        let minute_limit = self.effective_minute_limit();

        if hour >= self.effective_hour_limit() as usize {
            return None;
        }
        if self.burst.has_room(now) {
            return Some(AdmitPath::ContinueBurst);
        }
        if minute < minute_limit as usize {
            return Some(AdmitPath::Steady);
        }

        // Over the minute limit: a burst is the last resort
        let decision = self.burst.can_start_burst(now, minute, minute_limit);
        decision.allowed.then_some(AdmitPath::StartBurst(decision.size))
    }

    /// Whether the vendor told us its window is used up.
    fn headers_exhausted(&self, now: Instant) -> bool {
        let Some(state) = &self.last_headers else {
            return false;
        };
        match (state.observation.remaining, state.observation.reset_in) {
            (Some(0), Some(reset_in)) => now < state.observed_at + reset_in,
            _ => false,
        }
    }

    /// Report a successful call.
    pub fn record_success(&mut self, metrics: CallMetrics) {
        let now = self.clock.now();
        self.release_reservation();
        self.ledger.record_request(now);
        self.ledger.record_response(ResponseMetric {
            timestamp: now,
            response_time: metrics.response_time,
            success: true,
            status_code: metrics.status_code,
            rate_limited: false,
            retry_after: None,
        });

        let sample = metrics.response_time.as_secs_f64() * 1000.0;
        self.avg_response_ms = Some(match self.avg_response_ms {
            Some(avg) => avg * 0.9 + sample * 0.1,
            None => sample,
        });

        self.circuit.record_success();
        self.last_retry_after = None;

        let success_rate = self.ledger.success_rate();
        let avg = self.avg_response_ms();
        self.delay.optimize(now, success_rate, avg);

        trace!(
            vendor = %self.vendor,
            latency_ms = sample as u64,
            success_rate = success_rate,
            "Recorded success"
        );
    }

    /// Report a 429-class response.
    pub fn record_rate_limit_hit(&mut self, retry_after: Option<Duration>) {
        let now = self.clock.now();
        self.release_reservation();
        self.ledger.record_response(ResponseMetric {
            timestamp: now,
            response_time: Duration::ZERO,
            success: false,
            status_code: Some(429),
            rate_limited: true,
            retry_after,
        });
        self.register_rate_limit(now, retry_after);
    }

    fn register_rate_limit(&mut self, now: Instant, retry_after: Option<Duration>) {
        let hit = self.ledger.record_hit(now, retry_after);
        warn!(
            vendor = %self.vendor,
            minute_load = hit.requests_in_last_minute,
            hour_load = hit.requests_in_last_hour,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Rate limit hit"
        );

        if retry_after.is_some() {
            self.last_retry_after = retry_after;
        }
        self.recalibrate(now);
        self.delay.escalate(self.config.rate_limit_severity);

        if self.burst.is_bursting() {
            self.burst.end_burst(now, BurstEndReason::RateLimited);
        }
    }

    /// Infer the vendor's per-minute ceiling from the load at recent hits.
    fn recalibrate(&mut self, now: Instant) {
        if self.minute_source == LimitSource::Headers {
            debug!(vendor = %self.vendor, "Keeping header-reported limit");
            return;
        }

        let hits = self.ledger.hits_within(CALIBRATION_SPAN, now);
        if hits.len() < CALIBRATION_MIN_HITS {
            return;
        }

        let mean = hits.iter().map(|h| h.requests_in_last_minute as f64).sum::<f64>() / hits.len() as f64;
        let inferred = ((mean * self.config.safety_margin).floor() as u32).max(1);

        if self.detected.requests_per_minute != Some(inferred) {
            info!(
                vendor = %self.vendor,
                previous = ?self.detected.requests_per_minute,
                inferred = inferred,
                hits = hits.len(),
                mean_load = mean,
                "Inferred per-minute limit"
            );
        }
        self.detected.requests_per_minute = Some(inferred);
        self.minute_source = LimitSource::Inferred;
    }

    /// Report a failed call. Returns how the failure was classified.
    pub fn record_failure(&mut self, error: &str) -> FailureKind {
        let now = self.clock.now();
        let kind = self.classifier.classify(error);
        self.release_reservation();

        self.ledger.record_response(ResponseMetric {
            timestamp: now,
            response_time: Duration::ZERO,
            success: false,
            status_code: None,
            rate_limited: kind == FailureKind::RateLimited,
            retry_after: None,
        });
        self.circuit.record_failure(now);

        debug!(
            vendor = %self.vendor,
            error = %error,
            kind = ?kind,
            failures = self.circuit.consecutive_failures(),
            "Recorded failure"
        );

        match kind {
            FailureKind::RateLimited => self.register_rate_limit(now, None),
            FailureKind::Transient => self.delay.escalate(self.config.failure_severity),
        }
        kind
    }

    /// Learn limits from a response's rate-limit headers.
    pub fn learn_from_response_headers(&mut self, headers: &ResponseHeaders) {
        let now = self.clock.now();
        let observation = parse_rate_limit_headers(
            headers,
            &self.config.extra_header_prefixes,
            self.clock.wall_clock(),
        );

        let Some(observation) = observation else {
            if self.detected.requests_per_minute.is_none() {
                // Never looser than what was configured
                let assumed = self
                    .config
                    .headerless_requests_per_minute
                    .min(self.config.requests_per_minute);
                info!(
                    vendor = %self.vendor,
                    assumed = assumed,
                    "No rate-limit headers, assuming conservative limit"
                );
                self.detected.requests_per_minute = Some(assumed);
                self.minute_source = LimitSource::Assumed;
            }
            return;
        };

        if let (Some(limit), Some(reset_in)) = (observation.limit, observation.reset_in) {
            if limit > 0 {
                match TimeWindow::from_reset(reset_in) {
                    Some(TimeWindow::Minute) => {
                        if self.detected.requests_per_minute != Some(limit) {
                            info!(vendor = %self.vendor, limit = limit, "Vendor reports per-minute limit");
                        }
                        self.detected.requests_per_minute = Some(limit);
                        self.minute_source = LimitSource::Headers;
                    }
                    Some(TimeWindow::Hour) => {
                        if self.detected.requests_per_hour != Some(limit) {
                            info!(vendor = %self.vendor, limit = limit, "Vendor reports per-hour limit");
                        }
                        self.detected.requests_per_hour = Some(limit);
                    }
                    None => {
                        trace!(vendor = %self.vendor, reset_ms = reset_in.as_millis() as u64, "Reset too far out to classify");
                    }
                }
            }
        }

        self.last_headers = Some(HeaderState {
            observation,
            observed_at: now,
        });
    }

    /// Delay to wait before the next request.
    ///
    /// Always within `[min_delay_ms, max_delay_ms]`.
    pub fn optimal_delay(&self) -> Duration {
        let now = self.clock.now();

        if self.circuit.state() == CircuitState::Open {
            let recovery = self.circuit.recovery_time().as_secs_f64() * 1000.0;
            return millis_to_duration(self.delay.clamp_ms(recovery));
        }

        let mut delay_ms = if self.burst.has_room(now) {
            self.delay.min_delay_ms()
        } else {
            self.delay.base_delay_ms()
        };

        let success_rate = self.ledger.success_rate();
        if success_rate < 0.9 {
            delay_ms *= 1.5;
        } else if success_rate > 0.98 && self.avg_response_ms() < 2000.0 {
            delay_ms *= 0.9;
        }

        let utilization = self.minute_utilization(now);
        if utilization > LOAD_THRESHOLD {
            delay_ms *= 1.0 + utilization.min(1.0);
        }

        millis_to_duration(self.delay.clamp_ms(delay_ms))
    }

    fn minute_utilization(&self, now: Instant) -> f64 {
        let limit = self.effective_minute_limit().max(1);
        self.minute_load(now) as f64 / limit as f64
    }

    /// Full delay computation with backoff, jitter and the retry-after floor.
    pub fn calculate_delay(&mut self) -> DelayDecision {
        let now = self.clock.now();
        let ctx = DelayContext {
            consecutive_failures: self.circuit.consecutive_failures(),
            retry_after: self.last_retry_after,
            circuit_state: self.circuit.state(),
            success_rate: self.ledger.success_rate(),
            avg_response_ms: self.avg_response_ms(),
            requests_last_minute: self.minute_load(now),
            minute_limit: self.effective_minute_limit(),
        };
        self.delay.calculate(&ctx)
    }

    /// Why a call was not admitted, for callers that were refused.
    pub fn rejection(&self) -> CallError {
        if self.circuit.state() != CircuitState::Closed {
            CallError::CircuitOpenRejection
        } else {
            CallError::Deferred {
                retry_in: self.optimal_delay(),
            }
        }
    }

    /// Force the circuit closed and clear the failure count.
    pub fn reset_circuit(&mut self) {
        info!(vendor = %self.vendor, "Resetting circuit");
        self.circuit.reset();
    }

    /// Ask for a burst sized from the current minute load.
    pub fn start_burst(&mut self) -> BurstDecision {
        let now = self.clock.now();
        if !self.circuit.would_admit(now) {
            return BurstDecision {
                allowed: false,
                size: 0,
                reason: "circuit open".to_string(),
            };
        }

        let minute = self.minute_load(now);
        let decision = self
            .burst
            .can_start_burst(now, minute, self.effective_minute_limit());
        if decision.allowed && !self.burst.start_burst(now, decision.size) {
            return BurstDecision {
                allowed: false,
                size: 0,
                reason: "burst could not start".to_string(),
            };
        }
        decision
    }

    /// Stop the active burst at the caller's request.
    pub fn end_burst(&mut self) -> Option<BurstOutcome> {
        let now = self.clock.now();
        let outcome = self.burst.end_burst(now, BurstEndReason::Explicit);
        self.learn_from_burst();
        outcome
    }

    /// Remember the largest burst the vendor absorbed without throttling.
    fn learn_from_burst(&mut self) {
        let Some(outcome) = self.burst.last_outcome() else {
            return;
        };
        if outcome.reason.is_success()
            && self.detected.burst_size.map_or(true, |size| outcome.approved_size > size)
        {
            debug!(vendor = %self.vendor, size = outcome.approved_size, "Learned burst size");
            self.detected.burst_size = Some(outcome.approved_size);
        }
    }

    /// Side-effect free snapshot for dashboards and health checks.
    pub fn status(&self) -> LimiterStatus {
        let now = self.clock.now();
        LimiterStatus {
            vendor: self.vendor.clone(),
            circuit_state: self.circuit.state(),
            consecutive_failures: self.circuit.consecutive_failures(),
            circuit_recovery_remaining_ms: match self.circuit.state() {
                CircuitState::Open => Some(self.circuit.remaining_recovery(now).as_millis() as u64),
                _ => None,
            },
            would_admit: self.admission_path(now).is_some(),
            requests_last_minute: self.ledger.count_in(TimeWindow::Minute, now),
            requests_last_hour: self.ledger.count_in(TimeWindow::Hour, now),
            in_flight: self.in_flight_at(now),
            configured_requests_per_minute: self.config.requests_per_minute,
            configured_requests_per_hour: self.config.requests_per_hour,
            detected: self.detected,
            minute_limit_source: self.minute_source,
            effective_requests_per_minute: self.effective_minute_limit(),
            effective_requests_per_hour: self.effective_hour_limit(),
            minute_utilization: self.minute_utilization(now),
            success_rate: self.ledger.success_rate(),
            avg_response_ms: self.avg_response_ms(),
            base_delay_ms: self.delay.base_delay_ms(),
            optimal_delay_ms: self.optimal_delay().as_millis() as u64,
            average_recent_delay_ms: self.delay.average_recent_delay().map(|d| d.as_millis() as u64),
            rate_limit_hits_last_hour: self.ledger.hits_within(RETENTION, now).len(),
            burst: self.burst.status(now),
            last_headers: self.last_headers.as_ref().map(|h| h.observation.clone()),
        }
    }
}
