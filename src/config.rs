//! Configuration management for Ratewise.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatewiseError, Result};

/// Prefix for environment overrides, e.g. `RATEWISE__DEFAULTS__FAILURE_THRESHOLD=3`.
const ENV_PREFIX: &str = "RATEWISE";

/// Main configuration for Ratewise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RatewiseConfig {
    /// Limiter settings used for any vendor without its own entry
    #[serde(default)]
    pub defaults: LimiterConfig,

    /// Per-vendor limiter settings
    #[serde(default)]
    pub vendors: HashMap<String, LimiterConfig>,

    /// Dispatch loop settings
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Settings for one vendor's limiter.
///
/// All values are conservative; detected limits replace them as evidence
/// accumulates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimiterConfig {
    /// Configured ceiling per minute
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Configured ceiling per hour
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,

    /// Starting base delay between requests
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time after the last failure before an open circuit probes again
    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,

    /// Probes admitted while half-open before an outcome is recorded
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,

    /// Fraction of the inferred ceiling actually used
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    /// Base-delay escalation severity applied on a rate-limit hit
    #[serde(default = "default_rate_limit_severity")]
    pub rate_limit_severity: f64,

    /// Base-delay escalation severity applied on any other failure
    #[serde(default = "default_failure_severity")]
    pub failure_severity: f64,

    /// Exponential backoff base
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Jitter amplitude as a fraction of the computed delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Per-minute assumption used when a vendor sends no rate-limit headers
    #[serde(default = "default_headerless_requests_per_minute")]
    pub headerless_requests_per_minute: u32,

    /// Vendor-specific header prefixes tried after the standard triads,
    /// e.g. `x-acme-ratelimit-`
    #[serde(default)]
    pub extra_header_prefixes: Vec<String>,

    /// Substrings that mark a failure message as a rate-limit signal
    #[serde(default = "default_rate_limit_patterns")]
    pub rate_limit_patterns: Vec<String>,

    #[serde(default)]
    pub burst: BurstConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            base_delay_ms: default_base_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_time_ms: default_recovery_time_ms(),
            half_open_probes: default_half_open_probes(),
            safety_margin: default_safety_margin(),
            rate_limit_severity: default_rate_limit_severity(),
            failure_severity: default_failure_severity(),
            backoff_factor: default_backoff_factor(),
            jitter_factor: default_jitter_factor(),
            headerless_requests_per_minute: default_headerless_requests_per_minute(),
            extra_header_prefixes: Vec::new(),
            rate_limit_patterns: default_rate_limit_patterns(),
            burst: BurstConfig::default(),
        }
    }
}

impl LimiterConfig {
    /// Recovery interval as a `Duration`.
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }

    /// Check the settings for values the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(RatewiseError::Config(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if self.failure_threshold == 0 {
            return Err(RatewiseError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.requests_per_minute == 0 || self.requests_per_hour == 0 {
            return Err(RatewiseError::Config(
                "configured request limits must be non-zero".to_string(),
            ));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(RatewiseError::Config(format!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(RatewiseError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(RatewiseError::Config(format!(
                "jitter_factor must be in [0, 1], got {}",
                self.jitter_factor
            )));
        }
        self.burst.validate()
    }
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_requests_per_hour() -> u32 {
    1000
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_time_ms() -> u64 {
    30_000
}

fn default_half_open_probes() -> u32 {
    1
}

fn default_safety_margin() -> f64 {
    0.8
}

fn default_rate_limit_severity() -> f64 {
    2.0
}

fn default_failure_severity() -> f64 {
    0.5
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_headerless_requests_per_minute() -> u32 {
    5
}

fn default_rate_limit_patterns() -> Vec<String> {
    [
        "429",
        "rate limit",
        "ratelimit",
        "rate-limit",
        "too many requests",
        "quota exceeded",
        "throttl",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Burst scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstConfig {
    /// Whether bursts may be started at all
    #[serde(default = "default_burst_enabled")]
    pub enabled: bool,

    /// Upper bound on requests in one burst
    #[serde(default = "default_max_burst_size")]
    pub max_burst_size: u32,

    /// Maximum lifetime of one burst
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,

    /// Quiet period required after a burst ends
    #[serde(default = "default_burst_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Resize bursts from the outcome of recent ones
    #[serde(default = "default_adaptive_sizing")]
    pub adaptive_sizing: bool,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: default_burst_enabled(),
            max_burst_size: default_max_burst_size(),
            burst_window_ms: default_burst_window_ms(),
            cooldown_ms: default_burst_cooldown_ms(),
            adaptive_sizing: default_adaptive_sizing(),
        }
    }
}

impl BurstConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled && self.burst_window_ms == 0 {
            return Err(RatewiseError::Config(
                "burst.burst_window_ms must be non-zero when bursts are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_burst_enabled() -> bool {
    true
}

fn default_max_burst_size() -> u32 {
    10
}

fn default_burst_window_ms() -> u64 {
    10_000
}

fn default_burst_cooldown_ms() -> u64 {
    60_000
}

fn default_adaptive_sizing() -> bool {
    true
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Attempts per call in `dispatch_with_retry`, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether to sleep the optimal delay before every call
    #[serde(default = "default_pace_requests")]
    pub pace_requests: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            pace_requests: default_pace_requests(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_pace_requests() -> bool {
    true
}

impl RatewiseConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading ratewise configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewiseConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewiseError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered under
    /// `RATEWISE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading ratewise configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let config: RatewiseConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for a vendor, falling back to the defaults.
    pub fn for_vendor(&self, vendor: &str) -> &LimiterConfig {
        self.vendors.get(vendor).unwrap_or(&self.defaults)
    }

    /// Validate the defaults and every vendor entry.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for (vendor, limiter) in &self.vendors {
            limiter
                .validate()
                .map_err(|e| RatewiseError::Config(format!("vendor {}: {}", vendor, e)))?;
        }
        if self.dispatch.max_attempts == 0 {
            return Err(RatewiseError::Config(
                "dispatch.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RatewiseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.defaults.failure_threshold, 5);
        assert_eq!(config.defaults.recovery_time(), Duration::from_secs(30));
        assert_eq!(config.defaults.safety_margin, 0.8);
    }

    #[test]
    fn test_parse_vendor_overrides() {
        let yaml = r#"
defaults:
  requests_per_minute: 20
vendors:
  dell:
    requests_per_minute: 60
    failure_threshold: 3
    burst:
      max_burst_size: 5
"#;
        let config = RatewiseConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.defaults.requests_per_minute, 20);

        let dell = config.for_vendor("dell");
        assert_eq!(dell.requests_per_minute, 60);
        assert_eq!(dell.failure_threshold, 3);
        assert_eq!(dell.burst.max_burst_size, 5);
        // Unspecified fields keep their defaults
        assert_eq!(dell.requests_per_hour, 1000);
        assert!(dell.burst.adaptive_sizing);

        // Unknown vendors fall back to the defaults
        assert_eq!(config.for_vendor("lenovo").requests_per_minute, 20);
    }

    #[test]
    fn test_rejects_inverted_delay_bounds() {
        let yaml = r#"
defaults:
  min_delay_ms: 5000
  max_delay_ms: 100
"#;
        let err = RatewiseConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("min_delay_ms"));
    }

    #[test]
    fn test_rejects_bad_vendor_entry() {
        let yaml = r#"
vendors:
  hp:
    safety_margin: 1.5
"#;
        let err = RatewiseConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("vendor hp"));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        assert!(RatewiseConfig::from_yaml("defaults: [").is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RatewiseConfig::load(None).unwrap();
        assert_eq!(config.defaults, LimiterConfig::default());
        assert!(config.vendors.is_empty());
    }
}
