//! Adaptive admission control.
//!
//! One [`RateLimiter`] per vendor decides whether a call may be sent now and
//! how long to wait before the next one. It learns the vendor's real limits
//! from rate-limit headers and from the load observed at 429 responses, and
//! stops calling a vendor that keeps failing until a recovery interval has
//! passed.

mod burst;
mod circuit;
mod classifier;
mod clock;
mod delay;
mod headers;
mod ledger;
mod limiter;
mod registry;
mod status;

pub use burst::{BurstDecision, BurstEndReason, BurstManager, BurstOutcome, BurstStatus, MIN_BURST_SIZE};
pub use circuit::{CircuitBreaker, CircuitState};
pub use classifier::{FailureClassifier, FailureKind, PatternClassifier};
pub use clock::{Clock, MockClock, SystemClock};
pub use delay::{DelayCalculator, DelayContext, DelayDecision, DelayFactors};
pub use headers::{parse_rate_limit_headers, HeaderObservation, ResponseHeaders};
pub use ledger::{RateLimitHitRecord, RequestLedger, ResponseMetric, TimeWindow};
pub use limiter::{CallMetrics, DetectedLimits, LimitSource, RateLimiter};
pub use registry::{SharedLimiter, VendorRegistry};
pub use status::LimiterStatus;
