//! Rate-limit header parsing.
//!
//! Vendors advertise their limits through one of three near-standard naming
//! conventions, each a remaining/limit/reset triad:
//!
//! - `x-ratelimit-*`
//! - `x-rate-limit-*`
//! - `ratelimit-*`
//!
//! Names are matched case-insensitively and the first convention with any
//! field present wins. Malformed values are ignored rather than reported.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const STANDARD_PREFIXES: [&str; 3] = ["x-ratelimit-", "x-rate-limit-", "ratelimit-"];

/// Reset values above this are Unix timestamps rather than delta seconds.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Response headers with lower-cased names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    values: HashMap<String, String>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `Retry-After` in delta-seconds form.
    pub fn retry_after(&self) -> Option<Duration> {
        self.get("retry-after")
            .and_then(parse_seconds)
            .map(Duration::from_secs_f64)
    }
}

impl<K, V> FromIterator<(K, V)> for ResponseHeaders
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = ResponseHeaders::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// One parsed remaining/limit/reset triad.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderObservation {
    /// Prefix of the naming convention that matched
    pub prefix: String,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the vendor's window resets, relative to parse time
    #[serde(with = "optional_millis")]
    pub reset_in: Option<Duration>,
}

/// Extract the first rate-limit triad present in `headers`.
///
/// `extra_prefixes` are vendor-specific conventions tried after the standard
/// ones. Returns `None` when no convention has any field.
pub fn parse_rate_limit_headers(
    headers: &ResponseHeaders,
    extra_prefixes: &[String],
    now: DateTime<Utc>,
) -> Option<HeaderObservation> {
    let prefixes = STANDARD_PREFIXES
        .iter()
        .map(|p| p.to_string())
        .chain(extra_prefixes.iter().map(|p| p.to_ascii_lowercase()));

    for prefix in prefixes {
        let limit = headers.get(&format!("{}limit", prefix));
        let remaining = headers.get(&format!("{}remaining", prefix));
        let reset = headers.get(&format!("{}reset", prefix));

        if limit.is_none() && remaining.is_none() && reset.is_none() {
            continue;
        }

        return Some(HeaderObservation {
            limit: limit.and_then(parse_count),
            remaining: remaining.and_then(parse_count),
            reset_in: reset.and_then(|r| parse_reset(r, now)),
            prefix,
        });
    }

    None
}

fn parse_count(value: &str) -> Option<u32> {
    // Some vendors send "100;w=60" (IETF draft policy syntax)
    value.split([';', ',']).next()?.trim().parse().ok()
}

fn parse_seconds(value: &str) -> Option<f64> {
    let seconds: f64 = value.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

/// Interpret a reset value as delta-seconds or as a Unix timestamp.
fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let seconds = parse_seconds(value)?;
    if seconds >= EPOCH_THRESHOLD as f64 {
        let reset_at = DateTime::<Utc>::from_timestamp(seconds as i64, 0)?;
        let delta = (reset_at - now).to_std().ok()?;
        (!delta.is_zero()).then_some(delta)
    } else {
        Some(Duration::from_secs_f64(seconds))
    }
}

mod optional_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> ResponseHeaders {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let h = headers(&[("X-RateLimit-Limit", "100"), ("X-RATELIMIT-REMAINING", "42")]);
        let obs = parse_rate_limit_headers(&h, &[], Utc::now()).unwrap();

        assert_eq!(obs.prefix, "x-ratelimit-");
        assert_eq!(obs.limit, Some(100));
        assert_eq!(obs.remaining, Some(42));
        assert_eq!(obs.reset_in, None);
    }

    #[test]
    fn test_first_convention_wins() {
        let h = headers(&[
            ("x-rate-limit-limit", "10"),
            ("ratelimit-limit", "20"),
            ("x-ratelimit-reset", "30"),
        ]);
        let obs = parse_rate_limit_headers(&h, &[], Utc::now()).unwrap();

        // x-ratelimit- has a reset only, but it is the first convention present
        assert_eq!(obs.prefix, "x-ratelimit-");
        assert_eq!(obs.limit, None);
        assert_eq!(obs.reset_in, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_epoch_reset_is_relative_to_now() {
        let now = Utc::now();
        let reset = (now.timestamp() + 45).to_string();
        let h = headers(&[("x-ratelimit-limit", "100"), ("x-ratelimit-reset", reset.as_str())]);

        let obs = parse_rate_limit_headers(&h, &[], now).unwrap();
        let reset_in = obs.reset_in.unwrap();
        assert!(reset_in > Duration::from_secs(44) && reset_in <= Duration::from_secs(45));
    }

    #[test]
    fn test_epoch_reset_in_the_past_is_ignored() {
        let now = Utc::now();
        let reset = (now.timestamp() - 10).to_string();
        let h = headers(&[("ratelimit-reset", reset.as_str())]);

        let obs = parse_rate_limit_headers(&h, &[], now).unwrap();
        assert_eq!(obs.reset_in, None);
    }

    #[test]
    fn test_malformed_values_degrade_to_none() {
        let h = headers(&[
            ("x-ratelimit-limit", "lots"),
            ("x-ratelimit-remaining", "-1"),
            ("x-ratelimit-reset", "soon"),
        ]);
        let obs = parse_rate_limit_headers(&h, &[], Utc::now()).unwrap();
        assert_eq!(obs.limit, None);
        assert_eq!(obs.remaining, None);
        assert_eq!(obs.reset_in, None);
    }

    #[test]
    fn test_policy_suffix_is_stripped() {
        let h = headers(&[("ratelimit-limit", "100;w=60")]);
        let obs = parse_rate_limit_headers(&h, &[], Utc::now()).unwrap();
        assert_eq!(obs.limit, Some(100));
    }

    #[test]
    fn test_vendor_prefix_is_tried_last() {
        let h = headers(&[("X-Acme-Quota-Limit", "7")]);
        assert!(parse_rate_limit_headers(&h, &[], Utc::now()).is_none());

        let extra = vec!["x-acme-quota-".to_string()];
        let obs = parse_rate_limit_headers(&h, &extra, Utc::now()).unwrap();
        assert_eq!(obs.limit, Some(7));
    }

    #[test]
    fn test_no_rate_limit_headers() {
        let h = headers(&[("content-type", "application/json")]);
        assert!(parse_rate_limit_headers(&h, &[], Utc::now()).is_none());
    }

    #[test]
    fn test_retry_after_seconds() {
        let h = headers(&[("Retry-After", "12")]);
        assert_eq!(h.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(headers(&[("retry-after", "Wed, 21 Oct 2015")]).retry_after(), None);
    }
}
