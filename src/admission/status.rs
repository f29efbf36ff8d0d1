use serde::Serialize;

use super::burst::BurstStatus;
use super::circuit::CircuitState;
use super::headers::HeaderObservation;
use super::limiter::{DetectedLimits, LimitSource};

/// Point-in-time view of one vendor's limiter.
///
/// Produced by [`RateLimiter::status`](super::RateLimiter::status), which
/// never mutates the limiter, so consecutive snapshots taken without
/// intervening calls compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStatus {
    pub vendor: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_recovery_remaining_ms: Option<u64>,
    pub would_admit: bool,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    /// Admitted calls whose outcome has not been reported
    pub in_flight: usize,
    pub configured_requests_per_minute: u32,
    pub configured_requests_per_hour: u32,
    pub detected: DetectedLimits,
    pub minute_limit_source: LimitSource,
    pub effective_requests_per_minute: u32,
    pub effective_requests_per_hour: u32,
    pub minute_utilization: f64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub base_delay_ms: f64,
    pub optimal_delay_ms: u64,
    /// Mean of the most recent retry delays, if any were computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_recent_delay_ms: Option<u64>,
    pub rate_limit_hits_last_hour: usize,
    pub burst: BurstStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_headers: Option<HeaderObservation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{MockClock, RateLimiter};
    use crate::config::LimiterConfig;
    use std::sync::Arc;

    #[test]
    fn test_status_serializes_to_json() {
        let limiter = RateLimiter::new("acme", LimiterConfig::default())
            .with_clock(Arc::new(MockClock::new()));

        let json = serde_json::to_value(limiter.status()).unwrap();
        assert_eq!(json["vendor"], "acme");
        assert_eq!(json["circuit_state"], "CLOSED");
        assert_eq!(json["minute_limit_source"], "configured");
        assert_eq!(json["effective_requests_per_minute"], 30);
        assert!(json.get("circuit_recovery_remaining_ms").is_none());
        assert!(json.get("last_headers").is_none());
    }
}
