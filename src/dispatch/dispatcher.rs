//! Paced, admission-checked vendor calls.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::transport::{Transport, TransportError, TransportResponse};
use crate::admission::{CallMetrics, FailureKind, SharedLimiter, VendorRegistry};
use crate::config::DispatchConfig;
use crate::error::CallError;

/// Runs calls through each vendor's limiter.
///
/// Every delay is computed under the vendor's lock, the lock is released, and
/// only then does the dispatcher sleep. No lock is held across an `.await`.
pub struct Dispatcher {
    registry: Arc<VendorRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher using the registry's dispatch settings.
    pub fn new(registry: Arc<VendorRegistry>) -> Self {
        let config = registry.config().dispatch.clone();
        Self { registry, config }
    }

    pub fn with_config(registry: Arc<VendorRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<VendorRegistry> {
        &self.registry
    }

    /// Make one call to `vendor`, pacing it and reporting the outcome.
    pub async fn dispatch<T>(&self, vendor: &str, transport: &T) -> Result<TransportResponse, CallError>
    where
        T: Transport + ?Sized,
    {
        let limiter = self.registry.limiter(vendor);

        if self.config.pace_requests {
            let delay = limiter.lock().optimal_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        {
            let mut guard = limiter.lock();
            if !guard.can_admit() {
                let rejection = guard.rejection();
                debug!(vendor = %vendor, error = %rejection, "Call not admitted");
                return Err(rejection);
            }
        }

        let started = tokio::time::Instant::now();
        let result = transport.send(vendor).await;
        let elapsed = started.elapsed();

        Self::report(&limiter, vendor, result, elapsed)
    }

    fn report(
        limiter: &SharedLimiter,
        vendor: &str,
        result: Result<TransportResponse, TransportError>,
        elapsed: Duration,
    ) -> Result<TransportResponse, CallError> {
        let mut guard = limiter.lock();
        match result {
            Ok(response) if response.is_success() => {
                guard.record_success(CallMetrics::new(elapsed, response.status));
                guard.learn_from_response_headers(&response.headers);
                Ok(response)
            }
            Ok(response) if response.status == 429 => {
                let retry_after = response.headers.retry_after();
                guard.record_rate_limit_hit(retry_after);
                guard.learn_from_response_headers(&response.headers);
                Err(CallError::RateLimitExceeded { retry_after })
            }
            Ok(response) => {
                let message = if response.body.is_empty() {
                    format!("HTTP {}", response.status)
                } else {
                    format!("HTTP {}: {}", response.status, response.body)
                };
                Err(Self::failure(guard.record_failure(&message), message))
            }
            Err(err) => {
                debug!(vendor = %vendor, error = %err, "Transport error");
                let message = err.to_string();
                Err(Self::failure(guard.record_failure(&message), message))
            }
        }
    }

    fn failure(kind: FailureKind, message: String) -> CallError {
        match kind {
            FailureKind::RateLimited => CallError::RateLimitExceeded { retry_after: None },
            FailureKind::Transient => CallError::TransientFailure(message),
        }
    }

    /// Like [`dispatch`](Self::dispatch), retrying failed and deferred calls
    /// up to the configured number of attempts.
    ///
    /// Waits between attempts come from the limiter's full delay computation,
    /// which honours any retry-after the vendor sent. Circuit rejections are
    /// returned immediately.
    pub async fn dispatch_with_retry<T>(&self, vendor: &str, transport: &T) -> Result<TransportResponse, CallError>
    where
        T: Transport + ?Sized,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match self.dispatch(vendor, transport).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if attempt >= max_attempts || err == CallError::CircuitOpenRejection {
                info!(vendor = %vendor, attempts = attempt, error = %err, "Giving up");
                return Err(err);
            }

            let wait = match &err {
                CallError::Deferred { retry_in } => *retry_in,
                _ => self.registry.limiter(vendor).lock().calculate_delay().delay,
            };
            debug!(
                vendor = %vendor,
                attempt = attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
