//! Transport abstraction for vendor calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::admission::ResponseHeaders;

/// What came back from a vendor, whatever the status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: ResponseHeaders::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The call never produced a response.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Sends one request to a vendor.
///
/// Implementations wrap whatever client the caller uses. The dispatcher only
/// needs the status, the headers and whether the call failed outright.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, vendor: &str) -> Result<TransportResponse, TransportError>;
}

/// In-process vendor with a hidden per-minute limit.
///
/// Answers 429 with `retry-after` once the limit is reached within a sliding
/// minute, optionally advertises its limit through `x-ratelimit-*` headers,
/// and fails a configurable fraction of calls with a 503.
pub struct SimulatedVendor {
    limit_per_minute: u32,
    advertise_headers: bool,
    failure_rate: f64,
    latency_ms: Range<u64>,
    state: Mutex<SimulatedState>,
}

struct SimulatedState {
    accepted: VecDeque<Instant>,
    rng: StdRng,
}

enum SimulatedOutcome {
    Accepted { remaining: u32, reset_in: Duration },
    Throttled { retry_after: Duration },
    Unavailable,
}

const WINDOW: Duration = Duration::from_secs(60);

impl SimulatedVendor {
    pub fn new(limit_per_minute: u32, seed: u64) -> Self {
        Self {
            limit_per_minute,
            advertise_headers: true,
            failure_rate: 0.0,
            latency_ms: 50..250,
            state: Mutex::new(SimulatedState {
                accepted: VecDeque::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn advertise_headers(mut self, advertise: bool) -> Self {
        self.advertise_headers = advertise;
        self
    }

    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn latency_ms(mut self, range: Range<u64>) -> Self {
        self.latency_ms = range;
        self
    }

    fn decide(&self, now: Instant) -> (Duration, SimulatedOutcome) {
        let mut state = self.state.lock();
        while state
            .accepted
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= WINDOW)
        {
            state.accepted.pop_front();
        }

        let latency = if self.latency_ms.is_empty() {
            Duration::from_millis(self.latency_ms.start)
        } else {
            Duration::from_millis(state.rng.gen_range(self.latency_ms.clone()))
        };

        if self.failure_rate > 0.0 && state.rng.gen_bool(self.failure_rate) {
            return (latency, SimulatedOutcome::Unavailable);
        }

        let until_oldest_expires = |accepted: &VecDeque<Instant>| {
            accepted
                .front()
                .map(|at| WINDOW.saturating_sub(now.saturating_duration_since(*at)))
                .unwrap_or(WINDOW)
        };

        if state.accepted.len() >= self.limit_per_minute as usize {
            let retry_after = until_oldest_expires(&state.accepted);
            return (latency, SimulatedOutcome::Throttled { retry_after });
        }

        state.accepted.push_back(now);
        let remaining = self.limit_per_minute - state.accepted.len() as u32;
        let reset_in = until_oldest_expires(&state.accepted);
        (latency, SimulatedOutcome::Accepted { remaining, reset_in })
    }
}

#[async_trait]
impl Transport for SimulatedVendor {
    async fn send(&self, vendor: &str) -> Result<TransportResponse, TransportError> {
        let (latency, outcome) = self.decide(Instant::now());
        tokio::time::sleep(latency).await;

        let response = match outcome {
            SimulatedOutcome::Accepted { remaining, reset_in } => {
                let response = TransportResponse::new(200).with_body(format!("{{\"vendor\":\"{}\"}}", vendor));
                if self.advertise_headers {
                    response
                        .with_header("x-ratelimit-limit", self.limit_per_minute.to_string())
                        .with_header("x-ratelimit-remaining", remaining.to_string())
                        .with_header("x-ratelimit-reset", reset_in.as_secs().max(1).to_string())
                } else {
                    response
                }
            }
            SimulatedOutcome::Throttled { retry_after } => TransportResponse::new(429)
                .with_header("retry-after", retry_after.as_secs().max(1).to_string())
                .with_body("Too Many Requests"),
            SimulatedOutcome::Unavailable => TransportResponse::new(503).with_body("upstream unavailable"),
        };

        trace!(vendor = %vendor, status = response.status, latency_ms = latency.as_millis() as u64, "Simulated response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_vendor_enforces_its_limit() {
        let vendor = SimulatedVendor::new(3, 1);

        for remaining in (0..3).rev() {
            let response = vendor.send("acme").await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.headers.get("x-ratelimit-limit"), Some("3"));
            assert_eq!(
                response.headers.get("x-ratelimit-remaining"),
                Some(remaining.to_string().as_str())
            );
        }

        let throttled = vendor.send("acme").await.unwrap();
        assert_eq!(throttled.status, 429);
        assert!(throttled.headers.retry_after().is_some());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(vendor.send("acme").await.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_vendor_without_headers() {
        let vendor = SimulatedVendor::new(10, 1).advertise_headers(false);
        let response = vendor.send("acme").await.unwrap();
        assert!(response.is_success());
        assert!(response.headers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_vendor_always_failing() {
        let vendor = SimulatedVendor::new(10, 1).failure_rate(1.0);
        assert_eq!(vendor.send("acme").await.unwrap().status, 503);
    }
}
