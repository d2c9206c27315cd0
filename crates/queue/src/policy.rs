//! Per-tenant automation policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimit;
use crate::retry::RetryPolicy;
use crate::window::BusinessWindow;

/// Everything tunable about one tenant's automation.
///
/// Deserializable so operators load it from config rather than recompiling;
/// every knob has a sensible default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    /// When automated sends are permitted.
    pub window: BusinessWindow,
    /// Shared send budget per time window.
    pub rate_limit: RateLimit,
    /// Retry/backoff for failed sends.
    pub retry: RetryPolicy,
    /// How long an entry may sit in `sending` before the sweep reclaims it.
    #[serde(with = "secs")]
    pub sending_timeout: Duration,
    /// Per-call timeout on the external sender.
    #[serde(with = "secs")]
    pub send_call_timeout: Duration,
    /// Message the prepare-queue job enqueues for eligible leads.
    pub prepare: PrepareConfig,
    /// How often the automation loop ticks.
    #[serde(with = "secs")]
    pub tick_interval: Duration,
}

/// What the scheduled batch-preparation sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    pub message_type: String,
    pub message_template: String,
    pub message_content: String,
    pub priority: i32,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            message_type: "followup".to_string(),
            message_template: "followup_v1".to_string(),
            message_content: String::new(),
            priority: 0,
        }
    }
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            window: BusinessWindow::default(),
            rate_limit: RateLimit::default(),
            retry: RetryPolicy::default(),
            sending_timeout: Duration::from_secs(300),
            send_call_timeout: Duration::from_secs(30),
            prepare: PrepareConfig::default(),
            tick_interval: Duration::from_secs(5),
        }
    }
}

impl TenantPolicy {
    /// Policy with no window or rate restrictions (tests, backfills).
    pub fn unrestricted() -> Self {
        Self {
            window: BusinessWindow::always_open(),
            rate_limit: RateLimit::unlimited(),
            ..Default::default()
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_config() {
        let policy: TenantPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, TenantPolicy::default());
    }

    #[test]
    fn partial_config_overrides_one_knob() {
        let policy: TenantPolicy =
            serde_json::from_str(r#"{"retry": {"max_retries": 5, "base": 10, "cap": 60}}"#)
                .unwrap();
        assert_eq!(policy.retry.max_retries, 5);
        assert_eq!(policy.sending_timeout, Duration::from_secs(300));
    }
}
