//! Failure classification.

/// What a failure message says about the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The message reads like a throttling response
    RateLimited,
    /// Anything else: network errors, 5xx, timeouts
    Transient,
}

/// Decides whether a failure is a rate-limit signal.
///
/// Injected into each limiter so vendors with unusual error wording can be
/// handled without touching the limiter itself.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, message: &str) -> FailureKind;
}

/// Case-insensitive substring table.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: Vec<String>,
}

impl PatternClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> FailureKind {
        let message = message.to_lowercase();
        if self.patterns.iter().any(|p| message.contains(p.as_str())) {
            FailureKind::RateLimited
        } else {
            FailureKind::Transient
        }
    }
}

impl<F> FailureClassifier for F
where
    F: Fn(&str) -> FailureKind + Send + Sync,
{
    fn classify(&self, message: &str) -> FailureKind {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    #[test]
    fn test_default_patterns_match_common_phrasings() {
        let classifier = PatternClassifier::new(&LimiterConfig::default().rate_limit_patterns);

        for message in [
            "HTTP 429",
            "Rate Limit exceeded for key",
            "QUOTA EXCEEDED",
            "Too Many Requests",
            "request was throttled",
        ] {
            assert_eq!(classifier.classify(message), FailureKind::RateLimited, "{}", message);
        }
    }

    #[test]
    fn test_other_messages_are_transient() {
        let classifier = PatternClassifier::new(&LimiterConfig::default().rate_limit_patterns);
        assert_eq!(classifier.classify("connection reset by peer"), FailureKind::Transient);
        assert_eq!(classifier.classify("HTTP 503 Service Unavailable"), FailureKind::Transient);
    }

    #[test]
    fn test_empty_patterns_are_ignored() {
        let classifier = PatternClassifier::new(["", "slow down"]);
        assert_eq!(classifier.classify("anything"), FailureKind::Transient);
        assert_eq!(classifier.classify("please SLOW DOWN"), FailureKind::RateLimited);
    }

    #[test]
    fn test_closures_are_classifiers() {
        let classifier = |message: &str| {
            if message.starts_with("E42") {
                FailureKind::RateLimited
            } else {
                FailureKind::Transient
            }
        };
        assert_eq!(classifier.classify("E42: backoff"), FailureKind::RateLimited);
        assert_eq!(classifier.classify("E500"), FailureKind::Transient);
    }
}
