//! Retry policy with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for failed sends.
///
/// Constants live in configuration, never at call sites: the delivery worker
/// and the stale-claim sweep both consult the tenant's policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts before an entry is terminally `failed`.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base * 2^n`, capped.
    #[serde(with = "duration_secs")]
    pub base: Duration,
    #[serde(with = "duration_secs")]
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff applied to `scheduled_for` before attempt `retry_count + 1`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(31);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.cap)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(120),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(30));
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(120));
        assert_eq!(policy.backoff(31), Duration::from_secs(120));
    }

    #[test]
    fn retry_bound_is_strict() {
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn serde_uses_seconds() {
        let policy = RetryPolicy::default();
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["base"], 30);
        assert_eq!(json["cap"], 3600);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
