//! Registry of per-vendor limiters.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::classifier::FailureClassifier;
use super::clock::{Clock, SystemClock};
use super::limiter::RateLimiter;
use super::status::LimiterStatus;
use crate::config::RatewiseConfig;

/// A limiter shared between tasks. Lock it only for the duration of one
/// admission or record call, never across an `.await`.
pub type SharedLimiter = Arc<Mutex<RateLimiter>>;

/// Lazily creates one limiter per vendor and hands out shared handles.
///
/// Vendors never share state; each limiter is configured from its vendor's
/// entry in [`RatewiseConfig`], falling back to the defaults.
pub struct VendorRegistry {
    config: RatewiseConfig,
    clock: Arc<dyn Clock>,
    limiters: DashMap<String, SharedLimiter>,
    classifiers: DashMap<String, Arc<dyn FailureClassifier>>,
}

impl VendorRegistry {
    pub fn new(config: RatewiseConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a registry whose limiters all read the given clock.
    pub fn with_clock(config: RatewiseConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            limiters: DashMap::new(),
            classifiers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RatewiseConfig {
        &self.config
    }

    /// Use a custom failure classifier for a vendor.
    ///
    /// Applies to the vendor's limiter if it already exists and to any limiter
    /// created for it later.
    pub fn set_classifier(&self, vendor: &str, classifier: Arc<dyn FailureClassifier>) {
        self.classifiers.insert(vendor.to_string(), classifier.clone());
        if let Some(existing) = self.limiters.get(vendor) {
            existing.lock().set_classifier(classifier);
        }
    }

    /// Get the limiter for a vendor, creating it on first use.
    pub fn limiter(&self, vendor: &str) -> SharedLimiter {
        if let Some(existing) = self.limiters.get(vendor) {
            return existing.clone();
        }

        self.limiters
            .entry(vendor.to_string())
            .or_insert_with(|| {
                debug!(vendor = %vendor, "Creating limiter");
                let mut limiter = RateLimiter::new(vendor, self.config.for_vendor(vendor).clone())
                    .with_clock(self.clock.clone());
                if let Some(classifier) = self.classifiers.get(vendor) {
                    limiter = limiter.with_classifier(classifier.clone());
                }
                Arc::new(Mutex::new(limiter))
            })
            .clone()
    }

    /// Get the limiter for a vendor only if it already exists.
    pub fn get(&self, vendor: &str) -> Option<SharedLimiter> {
        self.limiters.get(vendor).map(|l| l.clone())
    }

    /// Vendors with a limiter, sorted.
    pub fn vendors(&self) -> Vec<String> {
        let mut vendors: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        vendors.sort();
        vendors
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Status of every vendor, sorted by vendor name.
    pub fn statuses(&self) -> Vec<LimiterStatus> {
        let limiters: Vec<SharedLimiter> = self.limiters.iter().map(|e| e.value().clone()).collect();
        let mut statuses: Vec<LimiterStatus> = limiters.iter().map(|l| l.lock().status()).collect();
        statuses.sort_by(|a, b| a.vendor.cmp(&b.vendor));
        statuses
    }

    /// Force a vendor's circuit closed. Returns `false` for unknown vendors.
    pub fn reset_circuit(&self, vendor: &str) -> bool {
        match self.get(vendor) {
            Some(limiter) => {
                limiter.lock().reset_circuit();
                true
            }
            None => {
                info!(vendor = %vendor, "No limiter to reset");
                false
            }
        }
    }

    /// Drop a vendor's limiter and everything it learned.
    pub fn remove(&self, vendor: &str) -> bool {
        self.limiters.remove(vendor).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{CircuitState, FailureKind, MockClock};
    use crate::config::LimiterConfig;
    use std::time::Duration;

    fn registry() -> (VendorRegistry, MockClock) {
        let mut config = RatewiseConfig::default();
        config.vendors.insert(
            "dell".to_string(),
            LimiterConfig {
                requests_per_minute: 60,
                failure_threshold: 2,
                ..LimiterConfig::default()
            },
        );
        let clock = MockClock::new();
        (VendorRegistry::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_limiters_are_created_once() {
        let (registry, _) = registry();
        assert!(registry.is_empty());

        let a = registry.limiter("dell");
        let b = registry.limiter("dell");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("lenovo").is_none());
    }

    #[test]
    fn test_vendor_config_falls_back_to_defaults() {
        let (registry, _) = registry();
        assert_eq!(registry.limiter("dell").lock().effective_minute_limit(), 60);
        assert_eq!(registry.limiter("lenovo").lock().effective_minute_limit(), 30);
    }

    #[test]
    fn test_vendors_are_isolated() {
        let (registry, _) = registry();
        let dell = registry.limiter("dell");
        let hp = registry.limiter("hp");

        dell.lock().record_failure("boom");
        dell.lock().record_failure("boom");

        assert_eq!(dell.lock().circuit_state(), CircuitState::Open);
        assert_eq!(hp.lock().circuit_state(), CircuitState::Closed);
        assert!(hp.lock().can_admit());
    }

    #[test]
    fn test_statuses_sorted() {
        let (registry, _) = registry();
        registry.limiter("hp");
        registry.limiter("dell");
        registry.limiter("lenovo");

        let names: Vec<String> = registry.statuses().into_iter().map(|s| s.vendor).collect();
        assert_eq!(names, vec!["dell", "hp", "lenovo"]);
        assert_eq!(registry.vendors(), names);
    }

    #[test]
    fn test_reset_circuit() {
        let (registry, _) = registry();
        assert!(!registry.reset_circuit("dell"));

        let dell = registry.limiter("dell");
        dell.lock().record_failure("boom");
        dell.lock().record_failure("boom");
        assert!(registry.reset_circuit("dell"));
        assert_eq!(dell.lock().circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_shared_clock_drives_recovery() {
        let (registry, clock) = registry();
        let dell = registry.limiter("dell");
        dell.lock().record_failure("boom");
        dell.lock().record_failure("boom");
        assert!(!dell.lock().can_admit());

        clock.advance(Duration::from_secs(31));
        assert!(dell.lock().can_admit());
    }

    #[test]
    fn test_custom_classifier_per_vendor() {
        let (registry, _) = registry();
        registry.set_classifier("hp", Arc::new(|_: &str| FailureKind::RateLimited));

        assert_eq!(registry.limiter("hp").lock().record_failure("E123"), FailureKind::RateLimited);
        assert_eq!(registry.limiter("dell").lock().record_failure("E123"), FailureKind::Transient);
    }

    #[test]
    fn test_remove_forgets_state() {
        let (registry, _) = registry();
        registry.limiter("dell").lock().record_rate_limit_hit(None);
        assert!(registry.remove("dell"));
        assert!(!registry.remove("dell"));
        assert_eq!(registry.limiter("dell").lock().status().rate_limit_hits_last_hour, 0);
    }
}
