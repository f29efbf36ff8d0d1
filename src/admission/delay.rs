//! Delay computation and the learned base delay.
//!
//! The calculator is the only owner of the base delay: the limiter's periodic
//! optimisation and its immediate escalations on failures both go through
//! [`DelayCalculator::optimize`] and [`DelayCalculator::escalate`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::circuit::CircuitState;
use crate::config::LimiterConfig;

/// Minimum spacing between two periodic base-delay adjustments.
const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(30);

/// Computed delays kept for diagnostics.
const HISTORY_LEN: usize = 10;

/// Exponent cap for the backoff term.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Utilisation of the per-minute limit above which the load multiplier applies.
pub const LOAD_THRESHOLD: f64 = 0.8;

/// Live limiter state a delay is computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayContext {
    pub consecutive_failures: u32,
    pub retry_after: Option<Duration>,
    pub circuit_state: CircuitState,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub requests_last_minute: usize,
    pub minute_limit: u32,
}

impl DelayContext {
    /// Fraction of the per-minute limit already used.
    pub fn utilization(&self) -> f64 {
        if self.minute_limit == 0 {
            return 1.0;
        }
        self.requests_last_minute as f64 / self.minute_limit as f64
    }
}

/// Multipliers and terms that produced a delay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayFactors {
    pub base_ms: f64,
    pub backoff: f64,
    pub circuit: f64,
    pub performance: f64,
    pub load: f64,
    pub jitter_ms: f64,
    pub retry_after_floor_ms: Option<f64>,
}

/// A computed delay with its explanation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayDecision {
    #[serde(serialize_with = "serialize_millis")]
    pub delay: Duration,
    pub reason: String,
    pub factors: DelayFactors,
}

/// Convert fractional milliseconds to a `Duration` at microsecond precision.
pub(crate) fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug)]
pub struct DelayCalculator {
    base_delay_ms: f64,
    min_delay_ms: f64,
    max_delay_ms: f64,
    backoff_factor: f64,
    jitter_factor: f64,
    last_optimized: Option<Instant>,
    history: VecDeque<Duration>,
    rng: StdRng,
}

impl DelayCalculator {
    pub fn new(config: &LimiterConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Calculator with a deterministic jitter sequence.
    pub fn with_seed(config: &LimiterConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &LimiterConfig, rng: StdRng) -> Self {
        let min_delay_ms = config.min_delay_ms as f64;
        let max_delay_ms = config.max_delay_ms as f64;
        Self {
            base_delay_ms: (config.base_delay_ms as f64).max(min_delay_ms).min(max_delay_ms),
            min_delay_ms,
            max_delay_ms,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
            last_optimized: None,
            history: VecDeque::with_capacity(HISTORY_LEN),
            rng,
        }
    }

    /// Current learned base delay in milliseconds.
    pub fn base_delay_ms(&self) -> f64 {
        self.base_delay_ms
    }

    pub fn min_delay_ms(&self) -> f64 {
        self.min_delay_ms
    }

    pub fn max_delay_ms(&self) -> f64 {
        self.max_delay_ms
    }

    /// Clamp a millisecond value into the configured bounds.
    pub fn clamp_ms(&self, ms: f64) -> f64 {
        if ms.is_nan() {
            return self.max_delay_ms;
        }
        // Unlike f64::clamp, tolerates min > max from an unvalidated config
        ms.max(self.min_delay_ms).min(self.max_delay_ms)
    }

    /// Compute the delay before the next attempt.
    pub fn calculate(&mut self, ctx: &DelayContext) -> DelayDecision {
        let mut reasons = Vec::new();

        let exponent = ctx.consecutive_failures.min(MAX_BACKOFF_EXPONENT);
        let backoff = self.backoff_factor.powi(exponent as i32);
        if exponent > 0 {
            reasons.push(format!("backoff x{:.2} after {} failures", backoff, ctx.consecutive_failures));
        }

        let circuit = match ctx.circuit_state {
            CircuitState::Open => 3.0,
            CircuitState::HalfOpen => 1.5,
            CircuitState::Closed => 1.0,
        };
        if circuit > 1.0 {
            reasons.push(format!("circuit {:?}", ctx.circuit_state));
        }

        let performance = if ctx.success_rate < 0.8 {
            reasons.push(format!("poor success rate {:.0}%", ctx.success_rate * 100.0));
            1.5
        } else if ctx.success_rate > 0.95 && ctx.avg_response_ms < 2000.0 {
            0.8
        } else {
            1.0
        };

        let utilization = ctx.utilization();
        let load = if utilization > LOAD_THRESHOLD {
            reasons.push(format!("load {:.0}% of minute limit", utilization * 100.0));
            1.0 + utilization.min(1.0)
        } else {
            1.0
        };

        let mut delay_ms = self.base_delay_ms * backoff * circuit * performance * load;

        let jitter_ms = delay_ms * self.jitter_factor * self.rng.gen_range(-0.5..0.5);
        delay_ms = self.clamp_ms(delay_ms + jitter_ms);

        let retry_after_floor_ms = ctx.retry_after.map(|d| d.as_secs_f64() * 1000.0);
        if let Some(floor) = retry_after_floor_ms {
            if delay_ms < floor {
                reasons.push(format!("server retry-after {:.0}ms", floor));
                delay_ms = floor;
            }
        }

        let reason = if reasons.is_empty() {
            "base delay".to_string()
        } else {
            reasons.join(", ")
        };
        let delay = millis_to_duration(delay_ms);

        self.history.push_back(delay);
        while self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }

        trace!(delay_ms = delay.as_millis() as u64, reason = %reason, "Calculated delay");

        DelayDecision {
            delay,
            reason,
            factors: DelayFactors {
                base_ms: self.base_delay_ms,
                backoff,
                circuit,
                performance,
                load,
                jitter_ms,
                retry_after_floor_ms,
            },
        }
    }

    /// Mean of the recently computed delays.
    pub fn average_recent_delay(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let total: Duration = self.history.iter().sum();
        Some(total / self.history.len() as u32)
    }

    /// Periodic base-delay tuning, applied at most once per 30 seconds.
    ///
    /// Returns `true` when this call was allowed to run.
    pub fn optimize(&mut self, now: Instant, success_rate: f64, avg_response_ms: f64) -> bool {
        if let Some(last) = self.last_optimized {
            if now.saturating_duration_since(last) < OPTIMIZE_INTERVAL {
                return false;
            }
        }
        self.last_optimized = Some(now);

        let previous = self.base_delay_ms;
        if success_rate > 0.95 && avg_response_ms < 2000.0 {
            self.base_delay_ms = self.clamp_ms(previous * 0.9);
        } else if success_rate < 0.8 || avg_response_ms > 5000.0 {
            self.base_delay_ms = self.clamp_ms(previous * 1.2);
        }

        if self.base_delay_ms != previous {
            debug!(
                from_ms = previous as u64,
                to_ms = self.base_delay_ms as u64,
                success_rate = success_rate,
                avg_response_ms = avg_response_ms as u64,
                "Adjusted base delay"
            );
        }
        true
    }

    /// Immediate defensive increase: `base × 1.5^severity`.
    ///
    /// Severity is an exponent, not a multiplier, so severity 0 leaves the
    /// base unchanged and a rate-limit hit (2.0) gives ×2.25 while a plain
    /// failure (0.5) gives about ×1.22.
    pub fn escalate(&mut self, severity: f64) {
        let previous = self.base_delay_ms;
        self.base_delay_ms = self.clamp_ms(previous * 1.5f64.powf(severity.max(0.0)));
        debug!(
            from_ms = previous as u64,
            to_ms = self.base_delay_ms as u64,
            severity = severity,
            "Escalated base delay"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LimiterConfig {
        LimiterConfig {
            base_delay_ms: 1000,
            min_delay_ms: 100,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
            ..LimiterConfig::default()
        }
    }

    fn context() -> DelayContext {
        DelayContext {
            consecutive_failures: 0,
            retry_after: None,
            circuit_state: CircuitState::Closed,
            success_rate: 0.9,
            avg_response_ms: 500.0,
            requests_last_minute: 0,
            minute_limit: 30,
        }
    }

    #[test]
    fn test_neutral_context_returns_base() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let decision = calc.calculate(&context());
        assert_eq!(decision.delay, Duration::from_millis(1000));
        assert_eq!(decision.reason, "base delay");
    }

    #[test]
    fn test_exponential_backoff() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let ctx = DelayContext {
            consecutive_failures: 3,
            ..context()
        };
        let decision = calc.calculate(&ctx);
        assert_eq!(decision.factors.backoff, 8.0);
        assert_eq!(decision.delay, Duration::from_millis(8000));
    }

    #[test]
    fn test_circuit_and_performance_multipliers() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let ctx = DelayContext {
            circuit_state: CircuitState::Open,
            success_rate: 0.5,
            ..context()
        };
        let decision = calc.calculate(&ctx);
        assert_eq!(decision.factors.circuit, 3.0);
        assert_eq!(decision.factors.performance, 1.5);
        assert_eq!(decision.delay, Duration::from_millis(4500));

        let ctx = DelayContext {
            circuit_state: CircuitState::HalfOpen,
            success_rate: 1.0,
            avg_response_ms: 100.0,
            ..context()
        };
        let decision = calc.calculate(&ctx);
        assert_eq!(decision.factors.circuit, 1.5);
        assert_eq!(decision.factors.performance, 0.8);
        assert_eq!(decision.delay, Duration::from_millis(1200));
    }

    #[test]
    fn test_load_multiplier_above_threshold() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let ctx = DelayContext {
            requests_last_minute: 27,
            minute_limit: 30,
            ..context()
        };
        let decision = calc.calculate(&ctx);
        assert!((decision.factors.load - 1.9).abs() < 1e-9);
        assert!(decision.reason.contains("load"));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let ctx = DelayContext {
            retry_after: Some(Duration::from_secs(90)),
            ..context()
        };
        // Above max_delay_ms, the server still wins
        let decision = calc.calculate(&ctx);
        assert_eq!(decision.delay, Duration::from_secs(90));
        assert!(decision.reason.contains("retry-after"));
    }

    #[test]
    fn test_result_is_clamped() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        let ctx = DelayContext {
            consecutive_failures: 50,
            circuit_state: CircuitState::Open,
            ..context()
        };
        assert_eq!(calc.calculate(&ctx).delay, Duration::from_millis(60_000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let cfg = LimiterConfig {
            jitter_factor: 0.2,
            ..config()
        };
        let mut calc = DelayCalculator::with_seed(&cfg, 7);
        for _ in 0..100 {
            let decision = calc.calculate(&context());
            let ms = decision.delay.as_secs_f64() * 1000.0;
            assert!((900.0..=1100.0).contains(&ms), "delay {} out of band", ms);
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let cfg = LimiterConfig {
            jitter_factor: 0.5,
            ..config()
        };
        let mut a = DelayCalculator::with_seed(&cfg, 42);
        let mut b = DelayCalculator::with_seed(&cfg, 42);
        for _ in 0..5 {
            assert_eq!(a.calculate(&context()).delay, b.calculate(&context()).delay);
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        assert_eq!(calc.average_recent_delay(), None);
        for _ in 0..25 {
            calc.calculate(&context());
        }
        assert_eq!(calc.history.len(), HISTORY_LEN);
        assert_eq!(calc.average_recent_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_optimize_is_rate_limited_to_every_30s() {
        let now = Instant::now();
        let mut calc = DelayCalculator::with_seed(&config(), 1);

        assert!(calc.optimize(now, 1.0, 100.0));
        assert!((calc.base_delay_ms() - 900.0).abs() < 1e-9);

        assert!(!calc.optimize(now + Duration::from_secs(10), 1.0, 100.0));
        assert!((calc.base_delay_ms() - 900.0).abs() < 1e-9);

        assert!(calc.optimize(now + Duration::from_secs(30), 0.5, 100.0));
        assert!((calc.base_delay_ms() - 1080.0).abs() < 1e-9);
    }

    #[test]
    fn test_optimize_slow_responses_increase_delay() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        calc.optimize(Instant::now(), 1.0, 6000.0);
        assert!((calc.base_delay_ms() - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_optimize_never_leaves_bounds() {
        let now = Instant::now();
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        for i in 0..100 {
            calc.optimize(now + Duration::from_secs(30 * i), 1.0, 10.0);
        }
        assert_eq!(calc.base_delay_ms(), 100.0);
    }

    #[test]
    fn test_escalate_scales_with_severity() {
        let mut calc = DelayCalculator::with_seed(&config(), 1);
        calc.escalate(2.0);
        assert!((calc.base_delay_ms() - 2250.0).abs() < 1e-9);

        let mut calc = DelayCalculator::with_seed(&config(), 1);
        calc.escalate(0.5);
        assert!((calc.base_delay_ms() - 1000.0 * 1.5f64.sqrt()).abs() < 1e-9);
    }
}
